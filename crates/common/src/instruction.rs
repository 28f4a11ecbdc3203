//! Instruction encoding and decoding for the sprig instruction set.
//!
//! An instruction is a variable-length record:
//! ```text
//! Byte 0:     opcode (u8)
//! Bytes 1..:  operands, each Byte (u8), Half (u16 LE) or Word (u64 LE)
//! ```
//! The operand list is fixed per opcode, see [`Opcode::operands`].

use crate::error::DecodeError;
use crate::opcode::{Opcode, Width};

/// Size of a word operand in bytes.
pub const WORD_SIZE: usize = 8;

/// One decoded instruction. Operands are widened to `u64` in `args`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The operation to perform.
    pub opcode: Opcode,
    /// Operands in encoding order. Unused trailing entries are zero.
    pub args: [u64; 3],
}

impl Instruction {
    /// Create an instruction. Extra operands beyond the opcode's arity are ignored.
    pub fn new(opcode: Opcode, operands: &[u64]) -> Self {
        let mut args = [0u64; 3];
        for (slot, value) in args.iter_mut().zip(operands) {
            *slot = *value;
        }
        Self { opcode, args }
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.opcode.encoded_len()
    }

    /// Always false: every instruction has at least an opcode byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Byte operand `i`.
    pub fn byte(&self, i: usize) -> u8 {
        self.args[i] as u8
    }

    /// Half operand `i`, unsigned.
    pub fn half(&self, i: usize) -> u16 {
        self.args[i] as u16
    }

    /// Half operand `i`, signed. Jump distances and frame offsets use this.
    pub fn signed_half(&self, i: usize) -> i16 {
        self.args[i] as u16 as i16
    }

    /// Word operand `i`.
    pub fn word(&self, i: usize) -> u64 {
        self.args[i]
    }

    /// Append the encoded instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode as u8);
        for (width, value) in self.opcode.operands().iter().zip(self.args) {
            match width {
                Width::Byte => out.push(value as u8),
                Width::Half => out.extend_from_slice(&(value as u16).to_le_bytes()),
                Width::Word => out.extend_from_slice(&value.to_le_bytes()),
            }
        }
    }

    /// Decode the instruction starting at `at`. Returns it with its encoded length.
    pub fn decode(code: &[u8], at: usize) -> Result<(Self, usize), DecodeError> {
        let byte = *code
            .get(at)
            .ok_or(DecodeError::Truncated { at, needed: 1 })?;
        let opcode = Opcode::try_from(byte)?;
        let len = opcode.encoded_len();
        if at + len > code.len() {
            return Err(DecodeError::Truncated {
                at,
                needed: at + len - code.len(),
            });
        }

        let mut args = [0u64; 3];
        let mut pos = at + 1;
        for (slot, width) in args.iter_mut().zip(opcode.operands()) {
            *slot = match width {
                Width::Byte => code[pos] as u64,
                Width::Half => read_half(code, pos) as u64,
                Width::Word => read_word(code, pos),
            };
            pos += width.size();
        }
        Ok((Self { opcode, args }, len))
    }
}

/// Read a little-endian half. The caller guarantees the bounds.
pub fn read_half(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([code[at], code[at + 1]])
}

/// Read a little-endian word. The caller guarantees the bounds.
pub fn read_word(code: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; WORD_SIZE];
    bytes.copy_from_slice(&code[at..at + WORD_SIZE]);
    u64::from_le_bytes(bytes)
}

/// Append-only builder for code blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeWriter {
    code: Vec<u8>,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length, which is also the offset of the next instruction.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Append one instruction and return its offset.
    pub fn emit(&mut self, opcode: Opcode, operands: &[u64]) -> usize {
        let at = self.code.len();
        Instruction::new(opcode, operands).encode(&mut self.code);
        at
    }

    /// Overwrite the half operand at byte offset `at`.
    pub fn patch_half(&mut self, at: usize, value: u16) {
        self.code[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_little_endian() {
        let mut out = Vec::new();
        Instruction::new(Opcode::SetFieldBkt, &[0x0102, 0x1122_3344_5566_7788]).encode(&mut out);
        assert_eq!(
            out,
            vec![
                Opcode::SetFieldBkt as u8,
                0x02,
                0x01,
                0x88,
                0x77,
                0x66,
                0x55,
                0x44,
                0x33,
                0x22,
                0x11
            ]
        );
    }

    #[test]
    fn decode_reports_length() {
        let mut w = CodeWriter::new();
        w.emit(Opcode::LoadInt, &[7]);
        w.emit(Opcode::Pop, &[]);
        let (first, len) = Instruction::decode(w.as_bytes(), 0).unwrap();
        assert_eq!(first.opcode, Opcode::LoadInt);
        assert_eq!(first.word(0), 7);
        assert_eq!(len, 9);
        let (second, len) = Instruction::decode(w.as_bytes(), 9).unwrap();
        assert_eq!(second.opcode, Opcode::Pop);
        assert_eq!(len, 1);
    }

    #[test]
    fn decode_truncated_operand() {
        let code = [Opcode::LoadInt as u8, 1, 2];
        assert_eq!(
            Instruction::decode(&code, 0),
            Err(DecodeError::Truncated { at: 0, needed: 6 })
        );
    }

    #[test]
    fn decode_past_end() {
        assert_eq!(
            Instruction::decode(&[], 0),
            Err(DecodeError::Truncated { at: 0, needed: 1 })
        );
    }

    #[test]
    fn signed_half_roundtrip() {
        let mut w = CodeWriter::new();
        w.emit(Opcode::Jmp, &[(-5i16) as u16 as u64]);
        let (instr, _) = Instruction::decode(w.as_bytes(), 0).unwrap();
        assert_eq!(instr.signed_half(0), -5);
    }

    #[test]
    fn patch_half_rewrites_operand() {
        let mut w = CodeWriter::new();
        let at = w.emit(Opcode::JmpFalse, &[0]);
        w.patch_half(at + 1, 12);
        let (instr, _) = Instruction::decode(w.as_bytes(), at).unwrap();
        assert_eq!(instr.half(0), 12);
    }
}
