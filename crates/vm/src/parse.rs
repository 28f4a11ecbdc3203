//! Reduction and parse-continuation instructions.
//!
//! A parse instruction sequence keeps three slots on the stack while it
//! runs: the saved step count, the accumulator and the current [`Pcr`].
//! `PARSE_FRAG_*`/`PARSE_FINISH_*` advance the parse one leg; when the
//! driver asks for code to be run, the following `PCR_CALL` runs it in a
//! nested execution and jumps back to the parse instruction. The `*3`
//! forms retire the three slots and, for `_WV3`, log how to undo the whole
//! parse.

use sprig_common::{Instruction, Opcode};
use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::machine::{Flow, Slot, Vm};
use crate::pcr::{self, Pcr};
use crate::tree::TreeRef;

/// Encoded size of `PARSE_FRAG_*`/`PARSE_FINISH_*` with their half operand.
const PARSE_INSTR_LEN: usize = 3;

impl Vm<'_> {
    // ---- reductions

    /// Copy a right-hand-side child of the node being reduced into a local.
    pub(crate) fn exec_init_rhs_el(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        let red_lel = self.heap.with_accum(accum, |_, a| Ok(a.run.red_lel))?;
        let child = match red_lel {
            Some(t) => self.heap.child(t, instr.half(0) as usize)?,
            None => None,
        };
        self.heap.upref_opt(child)?;
        self.set_local(instr.signed_half(1), Slot::from_tree(child))
    }

    /// Move the node being reduced into a local, keeping a reference for the
    /// driver when asked to.
    pub(crate) fn exec_init_lhs_el(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        let save = instr.byte(1) != 0;
        let (lhs, displaced) = self.heap.with_accum(accum, |heap, a| {
            let lhs = a.run.red_lel.take();
            let mut displaced = None;
            if save {
                heap.upref_opt(lhs)?;
                displaced = std::mem::replace(&mut a.run.parsed, lhs);
            }
            Ok((lhs, displaced))
        })?;
        self.heap.downref_opt(displaced)?;
        self.set_local(instr.signed_half(0), Slot::from_tree(lhs))
    }

    /// Hand the local back as the reduced node.
    pub(crate) fn exec_store_lhs_el(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        let idx = self.local(instr.signed_half(0))?;
        let lhs = match std::mem::take(&mut self.stack[idx]) {
            Slot::Tree(t) => Some(t),
            Slot::Nil => None,
            _ => return Err(self.mismatch("tree local")),
        };
        let displaced = self
            .heap
            .with_accum(accum, |_, a| Ok(std::mem::replace(&mut a.run.red_lel, lhs)))?;
        self.heap.downref_opt(displaced)
    }

    /// Reverse of a reduction: put the captured input token back.
    pub(crate) fn exec_restore_lhs(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        let lhs = TreeRef::from_word(instr.word(0));
        let displaced = self
            .heap
            .with_accum(accum, |_, a| Ok(std::mem::replace(&mut a.run.input1, lhs)))?;
        self.heap.downref_opt(displaced)
    }

    pub(crate) fn exec_reject(&mut self) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        self.heap.with_accum(accum, |_, a| {
            a.run.reject = true;
            Ok(())
        })
    }

    // ---- parse continuations

    fn pop_pcr(&mut self) -> Result<Pcr, RuntimeError> {
        let word = self.pop_word()?;
        Pcr::from_word(word).ok_or_else(|| RuntimeError::invariant(self.at, format!("bad parse state {word}")))
    }

    /// The step count saved `depth` slots below the top.
    fn saved_steps(&self, depth: usize) -> Result<u64, RuntimeError> {
        let slot = self
            .stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or(RuntimeError::StackUnderflow { at: self.at })?;
        match slot {
            Slot::Word(w) => Ok(*w),
            _ => Err(self.mismatch("saved steps")),
        }
    }

    /// Put the accumulator and the new state back. A finished leg skips the
    /// following `PCR_CALL`.
    fn resume_parse(&mut self, accum: TreeRef, pcr: Pcr) -> Result<(), RuntimeError> {
        trace!(target: "sprig::pcr", ?pcr, at = self.at, "parse leg");
        self.push_tree(Some(accum))?;
        self.push(Slot::Word(pcr.to_word()))?;
        if pcr == Pcr::Done {
            self.exec.ip += Opcode::PcrCall.encoded_len();
        }
        Ok(())
    }

    /// Replace the accumulator with its step count, under the accumulator.
    pub(crate) fn exec_parse_save_steps(&mut self) -> Result<(), RuntimeError> {
        let accum = self.pop_some()?;
        let steps = self.heap.with_accum(accum, |_, a| Ok(a.run.steps))?;
        self.push(Slot::Word(steps))?;
        self.push_tree(Some(accum))
    }

    pub(crate) fn exec_parse_frag(&mut self, instr: &Instruction, _undo: bool) -> Result<(), RuntimeError> {
        let entry = self.pop_pcr()?;
        let accum = self.pop_some()?;
        let pcr = pcr::parse_frag(&mut self.heap, accum, instr.half(0), entry);
        self.resume_parse(accum, pcr?)
    }

    pub(crate) fn exec_parse_finish(&mut self, _instr: &Instruction, undo: bool) -> Result<(), RuntimeError> {
        let entry = self.pop_pcr()?;
        let accum = self.pop_some()?;
        let pcr = pcr::parse_finish(&mut self.heap, accum, undo, entry);
        self.resume_parse(accum, pcr?)
    }

    /// `PARSE_FRAG_BKT`/`PARSE_FINISH_BKT`: back the parse up to the saved
    /// step count.
    pub(crate) fn exec_parse_undo(&mut self, _instr: &Instruction) -> Result<(), RuntimeError> {
        let steps = self.saved_steps(2)?;
        let entry = self.pop_pcr()?;
        let accum = self.pop_some()?;
        let pcr = pcr::undo_parse_frag(&mut self.heap, accum, steps, entry);
        self.resume_parse(accum, pcr?)
    }

    /// Run what the driver asked for, then go back to the parse instruction.
    pub(crate) fn exec_pcr_call(&mut self) -> Result<Flow, RuntimeError> {
        let accum = self
            .peek_tree(1)?
            .ok_or_else(|| self.mismatch("accumulator"))?;
        self.run_action(accum)?;
        if self.induce_exit {
            return Ok(Flow::Exit);
        }
        self.exec.ip = self
            .at
            .checked_sub(PARSE_INSTR_LEN)
            .ok_or_else(|| RuntimeError::invariant(self.at, "PCR_CALL without a parse instruction"))?;
        Ok(Flow::Continue)
    }

    pub(crate) fn exec_end_deck(&mut self) -> Result<(), RuntimeError> {
        let accum = self.current_accum()?;
        self.heap.with_accum(accum, |_, a| {
            a.run.on_deck = false;
            Ok(())
        })
    }

    /// Pop the state, the accumulator and the saved step count.
    fn retire_parse(&mut self) -> Result<(TreeRef, u64), RuntimeError> {
        let pcr = self.pop_pcr()?;
        if pcr != Pcr::Done {
            return Err(RuntimeError::invariant(self.at, format!("parse retired in state {pcr:?}")));
        }
        let accum = self.pop_some()?;
        let steps = self.pop_word()?;
        Ok((accum, steps))
    }

    /// Log a unit that backs the accumulator up to `steps`. The unit takes
    /// over the accumulator reference.
    fn log_parse_undo(&mut self, accum: TreeRef, steps: u64, undo: Opcode, retire: Opcode) -> Result<(), RuntimeError> {
        self.rcode_unit(&[
            (Opcode::LoadWord, &[steps]),
            (Opcode::LoadTree, &[TreeRef::to_word(Some(accum))]),
            (Opcode::ParseLoadStart, &[]),
            (undo, &[0]),
            (Opcode::PcrCall, &[]),
            (retire, &[]),
        ])
    }

    fn exit_check(&self) -> Flow {
        if self.induce_exit {
            Flow::Exit
        } else {
            Flow::Continue
        }
    }

    pub(crate) fn exec_parse_frag3(&mut self, undo: bool) -> Result<Flow, RuntimeError> {
        let (accum, steps) = self.retire_parse()?;
        if undo {
            self.log_parse_undo(accum, steps, Opcode::ParseFragBkt, Opcode::ParseFragBkt3)?;
        } else {
            self.heap.downref(accum)?;
        }
        Ok(self.exit_check())
    }

    pub(crate) fn exec_parse_frag_bkt3(&mut self) -> Result<(), RuntimeError> {
        let (accum, _) = self.retire_parse()?;
        self.heap.downref(accum)
    }

    /// Push the parse result and record the parse error, if any.
    pub(crate) fn exec_parse_finish3(&mut self, undo: bool) -> Result<Flow, RuntimeError> {
        let (accum, steps) = self.retire_parse()?;
        let (result, error) = self.heap.with_accum(accum, |heap, a| {
            heap.upref_opt(a.run.parse_error)?;
            Ok((a.result.take(), a.run.parse_error))
        })?;
        let old = std::mem::replace(&mut self.last_parse_error, error);
        self.heap.downref_opt(old)?;
        if error.is_some() {
            debug!(target: "sprig::pcr", at = self.at, "parse failed");
        }
        self.push_tree(result)?;
        if undo {
            self.log_parse_undo(accum, steps, Opcode::ParseFinishBkt, Opcode::ParseFinishBkt3)?;
        } else {
            self.heap.downref(accum)?;
        }
        Ok(self.exit_check())
    }

    /// The finished parse becomes a fragment again: input may follow.
    pub(crate) fn exec_parse_finish_bkt3(&mut self) -> Result<(), RuntimeError> {
        let (accum, _) = self.retire_parse()?;
        let stream = self.heap.with_accum(accum, |_, a| Ok(a.stream))?;
        self.heap.with_stream(stream, |heap, s| s.unset_eof(heap))?;
        self.heap.downref(accum)
    }
}
