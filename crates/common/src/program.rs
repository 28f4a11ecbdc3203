//! Program representation: a code block plus the tables its operands index.

use crate::lang_el::{LangElId, ID_ANY};

/// Static description of a function or iterator body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionInfo {
    pub name: String,
    /// Frame whose code the call enters.
    pub frame_id: u16,
    /// Number of argument slots the caller pushes.
    pub arg_size: u16,
    /// Number of local slots the body allocates.
    pub frame_size: u16,
}

/// A code entry point with its tree-local bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub name: String,
    /// Entry used when the frame runs with undo logging.
    pub code_wv: usize,
    /// Entry used when the frame's effects are never reverted.
    pub code_wc: usize,
    /// Frame-relative local offsets that hold owned trees.
    ///
    /// These are released when the frame is popped.
    pub trees: Vec<i16>,
}

/// A sprig program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// The instruction stream.
    pub code: Vec<u8>,
    /// Offset where the main program starts.
    pub root_code: usize,
    pub functions: Vec<FunctionInfo>,
    pub frames: Vec<FrameInfo>,
    /// String literals referenced by `LOAD_STR`.
    pub literals: Vec<Vec<u8>>,
    /// Number of attribute slots in the global object.
    pub global_size: u16,
    /// Type id that iterator searches treat as a wildcard.
    pub any_id: LangElId,
}

impl Program {
    /// Create a program with empty tables.
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            code,
            root_code: 0,
            functions: Vec::new(),
            frames: Vec::new(),
            literals: Vec::new(),
            global_size: 0,
            any_id: ID_ANY,
        }
    }

    pub fn function(&self, id: u16) -> Option<&FunctionInfo> {
        self.functions.get(id as usize)
    }

    pub fn frame(&self, id: u16) -> Option<&FrameInfo> {
        self.frames.get(id as usize)
    }

    pub fn literal(&self, id: u16) -> Option<&[u8]> {
        self.literals.get(id as usize).map(|l| l.as_slice())
    }

    /// Code size in bytes.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
