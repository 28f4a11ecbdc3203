//! Runtime errors for the sprig VM.
//!
//! Every variant is fatal: the running program is corrupt or the VM broke
//! one of its own invariants. Recoverable outcomes (end of data, rejected
//! parses, failed map inserts) are ordinary values, not errors. Variants
//! carry the code offset (`at`) of the faulting instruction where one exists.

use sprig_common::DecodeError;
use thiserror::Error;

/// Errors that abort program execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The opcode byte names no instruction.
    #[error("unknown opcode {byte:#04x} at offset {at}")]
    UnknownOpcode { at: usize, byte: u8 },

    /// Code ended in the middle of an instruction.
    #[error("truncated instruction at offset {at}")]
    Truncated { at: usize },

    /// A run ended with a different stack depth than it started with.
    #[error("stack imbalance on exit: expected depth {expected}, found {found}")]
    StackImbalance { expected: usize, found: usize },

    /// A user iterator resumed or was destroyed with a foreign stack footprint.
    #[error("iterator footprint mismatch at offset {at}: expected {expected}, found {found}")]
    IteratorFootprint {
        at: usize,
        expected: usize,
        found: usize,
    },

    /// A tree handle outlived its tree.
    #[error("stale tree handle #{index}")]
    StaleHandle { index: u32 },

    /// Any other broken VM invariant.
    #[error("internal invariant violated at offset {at}: {detail}")]
    InternalInvariant { at: usize, detail: String },

    /// A forward-only opcode appeared in replayed reverse code.
    #[error("{op} is not allowed in reverse code (offset {at})")]
    IllegalInReverse { at: usize, op: &'static str },

    /// HALT marks code the compiler must never reach.
    #[error("HALT executed at offset {at}")]
    Halt { at: usize },

    /// Stack exceeded its configured maximum depth.
    #[error("stack overflow at offset {at}")]
    StackOverflow { at: usize },

    /// Pop on an empty stack.
    #[error("stack underflow at offset {at}")]
    StackUnderflow { at: usize },

    /// An operand had the wrong kind.
    #[error("type mismatch at offset {at}: expected {expected}")]
    TypeMismatch { at: usize, expected: &'static str },

    /// Integer division with a zero divisor.
    #[error("division by zero at offset {at}")]
    DivisionByZero { at: usize },

    #[error("no parser registered for id {id} (offset {at})")]
    UnknownParser { at: usize, id: u16 },

    #[error("unknown frame {id} at offset {at}")]
    UnknownFrame { at: usize, id: u16 },

    #[error("unknown function {id} at offset {at}")]
    UnknownFunction { at: usize, id: u16 },

    #[error("unknown literal {id} at offset {at}")]
    UnknownLiteral { at: usize, id: u16 },

    /// A backing source failed to read.
    #[error("input error: {detail}")]
    Io { detail: String },
}

impl RuntimeError {
    /// Shorthand for [`RuntimeError::InternalInvariant`].
    pub fn invariant(at: usize, detail: impl Into<String>) -> Self {
        RuntimeError::InternalInvariant {
            at,
            detail: detail.into(),
        }
    }

    /// Attach the faulting offset to a decode failure.
    pub fn from_decode(err: DecodeError, at: usize) -> Self {
        match err {
            DecodeError::UnknownOpcode(byte) => RuntimeError::UnknownOpcode { at, byte },
            DecodeError::Truncated { at, .. } => RuntimeError::Truncated { at },
        }
    }

    /// True for the "internal invariant violated" family: corrupt code or
    /// VM bugs, as opposed to program faults like division by zero.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnknownOpcode { .. }
                | RuntimeError::Truncated { .. }
                | RuntimeError::StackImbalance { .. }
                | RuntimeError::IteratorFootprint { .. }
                | RuntimeError::StaleHandle { .. }
                | RuntimeError::InternalInvariant { .. }
                | RuntimeError::IllegalInReverse { .. }
                | RuntimeError::Halt { .. }
        )
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        assert_eq!(
            RuntimeError::DivisionByZero { at: 5 }.to_string(),
            "division by zero at offset 5"
        );
        assert_eq!(
            RuntimeError::UnknownOpcode { at: 3, byte: 0xee }.to_string(),
            "unknown opcode 0xee at offset 3"
        );
        assert_eq!(
            RuntimeError::StackImbalance {
                expected: 0,
                found: 2
            }
            .to_string(),
            "stack imbalance on exit: expected depth 0, found 2"
        );
    }

    #[test]
    fn decode_errors_keep_offset() {
        assert_eq!(
            RuntimeError::from_decode(DecodeError::UnknownOpcode(0xff), 9),
            RuntimeError::UnknownOpcode { at: 9, byte: 0xff }
        );
        assert_eq!(
            RuntimeError::from_decode(DecodeError::Truncated { at: 4, needed: 2 }, 4),
            RuntimeError::Truncated { at: 4 }
        );
    }

    #[test]
    fn internal_classification() {
        assert!(RuntimeError::invariant(0, "x").is_internal());
        assert!(RuntimeError::Halt { at: 0 }.is_internal());
        assert!(!RuntimeError::DivisionByZero { at: 0 }.is_internal());
    }
}
