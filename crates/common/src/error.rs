//! Decode errors for sprig bytecode.

use thiserror::Error;

/// Errors that occur while decoding an instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Byte does not name any opcode.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// The code ends in the middle of an instruction's operands.
    #[error("truncated instruction at offset {at} (needs {needed} more bytes)")]
    Truncated { at: usize, needed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_unknown_opcode() {
        assert_eq!(
            DecodeError::UnknownOpcode(0xee).to_string(),
            "unknown opcode: 0xee"
        );
    }

    #[test]
    fn display_truncated() {
        assert_eq!(
            DecodeError::Truncated { at: 12, needed: 7 }.to_string(),
            "truncated instruction at offset 12 (needs 7 more bytes)"
        );
    }
}
