//! Error types for the sprig assembler.

use sprig_common::DecodeError;
use thiserror::Error;

/// Errors produced while assembling text or disassembling code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsmError {
    /// An unrecognized opcode mnemonic was encountered.
    #[error("line {line}: unknown opcode '{token}'")]
    UnknownOpcode { line: usize, token: String },

    /// An opcode did not have enough operands.
    #[error("line {line}: {opcode} expects {expected} operand(s)")]
    MissingArgument {
        line: usize,
        opcode: &'static str,
        expected: usize,
    },

    /// A numeric literal could not be parsed or does not fit its operand.
    #[error("line {line}: invalid number '{token}'")]
    InvalidNumber { line: usize, token: String },

    /// A token appeared where it was not expected.
    #[error("line {line}: unexpected token '{token}'")]
    UnexpectedToken { line: usize, token: String },

    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },

    #[error("line {line}: undefined label '{label}'")]
    UndefinedLabel { line: usize, label: String },

    #[error("line {line}: label '{label}' defined twice")]
    DuplicateLabel { line: usize, label: String },

    /// The jump distance does not fit a signed half.
    #[error("line {line}: jump to '{label}' out of range")]
    JumpOutOfRange { line: usize, label: String },

    #[error("line {line}: bad directive: {detail}")]
    BadDirective { line: usize, detail: String },

    /// The code handed to the disassembler does not decode.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_unknown_opcode() {
        let e = AsmError::UnknownOpcode {
            line: 3,
            token: "FOO".to_string(),
        };
        assert_eq!(e.to_string(), "line 3: unknown opcode 'FOO'");
    }

    #[test]
    fn error_display_missing_argument() {
        let e = AsmError::MissingArgument {
            line: 7,
            opcode: "GET_FIELD_R",
            expected: 1,
        };
        assert_eq!(e.to_string(), "line 7: GET_FIELD_R expects 1 operand(s)");
    }

    #[test]
    fn error_display_jump_out_of_range() {
        let e = AsmError::JumpOutOfRange {
            line: 2,
            label: "far".to_string(),
        };
        assert_eq!(e.to_string(), "line 2: jump to 'far' out of range");
    }

    #[test]
    fn decode_errors_convert() {
        let e: AsmError = DecodeError::UnknownOpcode(0xee).into();
        assert_eq!(e.to_string(), "decode error: unknown opcode: 0xee");
    }
}
