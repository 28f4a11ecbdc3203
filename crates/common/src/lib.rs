//! sprig common types and instruction encoding.
//!
//! This crate provides the foundational data structures shared by the
//! interpreter and the assembler:
//!
//! - [`Opcode`] — the closed opcode set with operand widths
//! - [`Instruction`] — variable-length encode/decode
//! - [`Program`] — code plus function, frame and literal tables
//! - [`lang_el`] — reserved type ids
//! - [`DecodeError`] — errors from decoding byte streams

pub mod error;
pub mod instruction;
pub mod lang_el;
pub mod opcode;
pub mod program;

// Re-export commonly used types at the crate root.
pub use error::DecodeError;
pub use instruction::{CodeWriter, Instruction, WORD_SIZE};
pub use lang_el::LangElId;
pub use opcode::{Opcode, Width, ALL_OPCODES};
pub use program::{FrameInfo, FunctionInfo, Program};

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Strategy that generates a random valid Opcode.
    fn arb_opcode() -> impl Strategy<Value = Opcode> {
        prop::sample::select(ALL_OPCODES)
    }

    /// Strategy for an instruction whose operands fit their declared widths.
    fn arb_instruction() -> impl Strategy<Value = Instruction> {
        (arb_opcode(), any::<[u64; 3]>()).prop_map(|(op, raw)| {
            let mut operands = [0u64; 3];
            for (i, width) in op.operands().iter().enumerate() {
                operands[i] = match width {
                    Width::Byte => raw[i] & 0xff,
                    Width::Half => raw[i] & 0xffff,
                    Width::Word => raw[i],
                };
            }
            Instruction::new(op, &operands)
        })
    }

    proptest! {
        /// A stream of instructions decodes back instruction by instruction.
        #[test]
        fn stream_decodes_in_order(instrs in prop::collection::vec(arb_instruction(), 0..40)) {
            let mut code = Vec::new();
            for instr in &instrs {
                instr.encode(&mut code);
            }
            let mut at = 0;
            for instr in &instrs {
                let (decoded, len) = Instruction::decode(&code, at).unwrap();
                prop_assert_eq!(*instr, decoded);
                prop_assert_eq!(len, instr.len());
                at += len;
            }
            prop_assert_eq!(at, code.len());
        }

        /// Random bytes either decode to an instruction that re-encodes to the
        /// same prefix, or fail with a decode error.
        #[test]
        fn random_bytes_decode(bytes in prop::collection::vec(any::<u8>(), 1..32)) {
            match Instruction::decode(&bytes, 0) {
                Ok((instr, len)) => {
                    let mut out = Vec::new();
                    instr.encode(&mut out);
                    prop_assert_eq!(&out[..], &bytes[..len]);
                }
                Err(e) => match e {
                    DecodeError::UnknownOpcode(_) | DecodeError::Truncated { .. } => {}
                },
            }
        }
    }
}
