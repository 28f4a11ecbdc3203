//! sprig virtual machine: a reversible bytecode interpreter for parser
//! programs.
//!
//! The VM is a stack machine with:
//! - A heap of reference-counted, copy-on-write trees
//! - An operand stack holding trees, raw words, references and iterators
//! - Input streams built from a queue of buffers and pluggable sources
//! - A reverse-code log: `_WV` instructions record their inverse so the
//!   effects of grammar actions can be undone when the parser backtracks
//! - Resumable parse continuations that suspend the interpreter while an
//!   external parse driver runs
//!
//! # Usage
//!
//! ```
//! use sprig_common::{CodeWriter, Opcode, Program};
//! use sprig_vm::run;
//!
//! let mut w = CodeWriter::new();
//! w.emit(Opcode::LoadInt, &[3]);
//! w.emit(Opcode::LoadInt, &[4]);
//! w.emit(Opcode::AddInt, &[]);
//! w.emit(Opcode::Pop, &[]);
//! w.emit(Opcode::Stop, &[]);
//! let program = Program::new(w.into_bytes());
//!
//! assert_eq!(run(&program), Ok(0));
//! ```

pub mod error;
pub mod input;
pub mod iter;
pub mod machine;
pub mod map;
pub mod pcr;
pub mod rcode;
pub mod source;
pub mod tree;

mod execute;
mod mutate;
mod parse;

pub use error::RuntimeError;
pub use input::{InputStream, RunBuf};
pub use machine::{Slot, Vm, VmOptions};
pub use pcr::{Action, DriverCx, ParseDriver, ParseRun, Pcr};
pub use source::{Fetched, Source};
pub use tree::{Head, Heap, Payload, Tree, TreeRef};

use sprig_common::Program;

/// Run a program's root code and return its exit status.
///
/// The status is 0 unless the program ran `EXIT`.
///
/// # Errors
///
/// Returns [`RuntimeError`] if execution fails (unknown opcode, stack
/// imbalance, division by zero, `HALT`, and so on).
pub fn run(program: &Program) -> Result<i64, RuntimeError> {
    Vm::new(program).run()
}
