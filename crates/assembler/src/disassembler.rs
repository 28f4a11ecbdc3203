//! Disassembler: bytecode → assembly text.
//!
//! One instruction per line, prefixed by its byte offset. Jumps carry a
//! trailing comment with their absolute target. The offset prefix is
//! accepted and ignored by the assembler, so the output reassembles to the
//! same bytes.

use std::fmt::Write as _;

use sprig_common::{Instruction, Opcode, Width};

use crate::error::AsmError;

pub(crate) fn disassemble(code: &[u8]) -> Result<String, AsmError> {
    let mut out = String::new();
    let mut at = 0;
    while at < code.len() {
        let (instr, len) = Instruction::decode(code, at)?;
        let _ = write!(out, "{at:04}: {}", format_instr(&instr));
        if is_jump(instr.opcode) {
            let target = (at + len) as i64 + instr.signed_half(0) as i64;
            let _ = write!(out, " ; -> {target:04}");
        }
        out.push('\n');
        at += len;
    }
    Ok(out)
}

pub(crate) fn is_jump(opcode: Opcode) -> bool {
    matches!(opcode, Opcode::Jmp | Opcode::JmpFalse | Opcode::JmpTrue)
}

fn format_instr(instr: &Instruction) -> String {
    let mut line = instr.opcode.mnemonic().to_string();
    for (i, width) in instr.opcode.operands().iter().enumerate() {
        let value = instr.args[i];
        let _ = match width {
            Width::Byte => write!(line, " {value}"),
            // Halves above i16::MAX are frame offsets or back jumps.
            Width::Half if value > i16::MAX as u64 => write!(line, " {}", instr.signed_half(i)),
            Width::Half => write!(line, " {value}"),
            Width::Word if instr.opcode == Opcode::LoadInt => write!(line, " {}", value as i64),
            Width::Word => write!(line, " {value}"),
        };
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_common::CodeWriter;

    #[test]
    fn empty_code() {
        assert_eq!(disassemble(&[]).unwrap(), "");
    }

    #[test]
    fn offsets_and_operands() {
        let mut w = CodeWriter::new();
        w.emit(Opcode::LoadInt, &[(-7i64) as u64]);
        w.emit(Opcode::GetLocalR, &[(-4i16) as u16 as u64]);
        w.emit(Opcode::Print, &[1]);
        w.emit(Opcode::Stop, &[]);
        assert_eq!(
            disassemble(w.as_bytes()).unwrap(),
            "0000: LOAD_INT -7\n0009: GET_LOCAL_R -4\n0012: PRINT 1\n0014: STOP\n"
        );
    }

    #[test]
    fn jumps_show_target() {
        let mut w = CodeWriter::new();
        w.emit(Opcode::LoadTrue, &[]);
        w.emit(Opcode::JmpFalse, &[1]);
        w.emit(Opcode::Pop, &[]);
        w.emit(Opcode::Stop, &[]);
        let text = disassemble(w.as_bytes()).unwrap();
        assert!(text.contains("0001: JMP_FALSE 1 ; -> 0005"), "{text}");
    }

    #[test]
    fn unknown_byte_is_an_error() {
        assert!(matches!(
            disassemble(&[0x00]),
            Err(AsmError::Decode(_))
        ));
    }
}
