//! Reverse-code log.
//!
//! A `_WV` instruction appends the inverse of its effect to the running
//! parse's collect buffer. The inverse is a *unit*: one or more reverse
//! instructions followed by a single byte holding the unit's size, so the
//! buffer can be walked backwards without an index.
//!
//! When a reduction finishes, [`make_reverse_code`] moves the collected
//! units, last first, onto the parse's reverse stack as one *group*:
//!
//! ```text
//! PCR_END_DECK | word 1                        deck terminator group
//! unit_n .. unit_1 | PCR_RET | word len        the undo group
//! ```
//!
//! The trailing word makes popping a group O(1). Groups are replayed by the
//! interpreter in reverse mode, or swept by [`downref_all`] when the parse
//! commits and the captured trees are no longer needed.

use sprig_common::{Instruction, Opcode, WORD_SIZE};
use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::tree::{Heap, TreeRef};

/// Largest encodable unit, bounded by its one-byte size trailer.
pub const MAX_UNIT_LEN: usize = 255;

/// Growable buffer of reverse code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtCodeVect {
    code: Vec<u8>,
}

impl RtCodeVect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn clear(&mut self) {
        self.code.clear();
    }

    /// Append one reverse instruction and return its encoded size.
    pub fn append(&mut self, opcode: Opcode, operands: &[u64]) -> usize {
        let instr = Instruction::new(opcode, operands);
        instr.encode(&mut self.code);
        trace!(target: "sprig::rcode", op = opcode.mnemonic(), "append");
        instr.len()
    }

    /// Append an instruction whose single word operand is a tree.
    pub fn append_tree(&mut self, opcode: Opcode, tree: Option<TreeRef>) -> usize {
        self.append(opcode, &[TreeRef::to_word(tree)])
    }

    /// Close the current unit with its size trailer.
    pub fn append_unit_len(&mut self, len: usize) -> Result<(), RuntimeError> {
        if len > MAX_UNIT_LEN {
            return Err(RuntimeError::invariant(0, format!("reverse unit of {len} bytes")));
        }
        self.code.push(len as u8);
        Ok(())
    }

    fn append_word(&mut self, word: u64) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    /// Detach the topmost group, including its closing `PCR_RET` or
    /// `PCR_END_DECK` but not its length word.
    pub fn pop_group(&mut self) -> Option<Vec<u8>> {
        let total = self.code.len();
        if total < WORD_SIZE {
            return None;
        }
        let len = sprig_common::instruction::read_word(&self.code, total - WORD_SIZE) as usize;
        let start = (total - WORD_SIZE).checked_sub(len)?;
        let mut group = self.code.split_off(start);
        group.truncate(len);
        trace!(target: "sprig::rcode", len, remaining = start, "pop group");
        Some(group)
    }
}

/// Move everything collected since the last call onto `reverse` as one
/// group, preceded by a deck terminator group. Returns false, and leaves
/// `reverse` untouched, when nothing was collected.
pub fn make_reverse_code(
    collect: &mut RtCodeVect,
    reverse: &mut RtCodeVect,
) -> Result<bool, RuntimeError> {
    if collect.is_empty() {
        return Ok(false);
    }

    reverse.code.push(Opcode::PcrEndDeck as u8);
    reverse.append_word(1);

    let start = reverse.len();
    let code = &collect.code;
    let mut end = code.len();
    while end > 0 {
        let len = code[end - 1] as usize;
        let unit_start = (end - 1)
            .checked_sub(len)
            .ok_or_else(|| RuntimeError::invariant(0, "reverse unit overruns collect buffer"))?;
        reverse.code.extend_from_slice(&code[unit_start..end - 1]);
        end = unit_start;
    }
    reverse.code.push(Opcode::PcrRet as u8);
    let len = reverse.len() - start;
    reverse.append_word(len as u64);

    debug!(target: "sprig::rcode", len, total = reverse.len(), "made reverse code");
    collect.clear();
    Ok(true)
}

/// Pop the topmost group of `reverse`.
pub fn pop_reverse_code(reverse: &mut RtCodeVect) -> Option<Vec<u8>> {
    reverse.pop_group()
}

/// Release every tree captured in `reverse` without undoing anything,
/// emptying it. Used when the parse commits or dies.
pub fn downref_all(heap: &mut Heap, reverse: &mut RtCodeVect) -> Result<(), RuntimeError> {
    if !reverse.is_empty() {
        debug!(target: "sprig::rcode", len = reverse.len(), "discarding reverse code");
    }
    while let Some(group) = reverse.pop_group() {
        downref_code(heap, &group)?;
    }
    if !reverse.is_empty() {
        return Err(RuntimeError::invariant(0, "malformed reverse code stack"));
    }
    Ok(())
}

/// Release the trees captured by units not yet moved into a group.
pub fn downref_collect(heap: &mut Heap, collect: &mut RtCodeVect) -> Result<(), RuntimeError> {
    let code = std::mem::take(&mut collect.code);
    let mut end = code.len();
    while end > 0 {
        let len = code[end - 1] as usize;
        let start = (end - 1)
            .checked_sub(len)
            .ok_or_else(|| RuntimeError::invariant(0, "reverse unit overruns collect buffer"))?;
        downref_code(heap, &code[start..end - 1])?;
        end = start;
    }
    Ok(())
}

/// Walk reverse code performing only the releases.
fn downref_code(heap: &mut Heap, code: &[u8]) -> Result<(), RuntimeError> {
    let mut at = 0;
    while at < code.len() {
        let (instr, len) = Instruction::decode(code, at).map_err(|e| RuntimeError::from_decode(e, at))?;
        at += len;
        let tree = |i: usize| TreeRef::from_word(instr.word(i));
        match instr.opcode {
            Opcode::PcrRet | Opcode::PcrEndDeck | Opcode::Stop => return Ok(()),

            Opcode::LoadTree
            | Opcode::PtrDerefBkt
            | Opcode::SetTokenDataBkt
            | Opcode::ListRemoveEndBkt
            | Opcode::StreamPullBkt
            | Opcode::RestoreLhs => heap.downref_opt(tree(0))?,
            Opcode::SetFieldBkt | Opcode::SetListMemBkt | Opcode::MapInsertBkt => {
                heap.downref_opt(tree(1))?
            }
            Opcode::MapStoreBkt | Opcode::MapRemoveBkt | Opcode::StreamAppendBkt => {
                heap.downref_opt(tree(0))?;
                heap.downref_opt(tree(1))?;
            }

            op if op.is_reverse() => {}
            op => {
                return Err(RuntimeError::IllegalInReverse {
                    at: at - len,
                    op: op.mnemonic(),
                })
            }
        }
    }
    Ok(())
}
