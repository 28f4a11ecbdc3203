//! Opcode definitions for the sprig instruction set.
//!
//! Every instruction is one opcode byte followed by a fixed list of
//! operands. The list is part of the opcode's definition and is never
//! inferred from the code itself.
//!
//! Most state-mutating families come in three flavours:
//!
//! - `_R` reads without any undo bookkeeping.
//! - `_WC` writes and commits: copy-on-write still applies, nothing is logged.
//! - `_WV` writes and appends the inverse operation to the reverse-code log.
//!
//! The `_BKT` forms only ever appear in generated reverse code and perform
//! the inverse effect of their `_WV` counterpart.

use crate::error::DecodeError;

/// Width of one operand in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// One byte.
    Byte,
    /// Two bytes, little-endian. Signed for jump distances.
    Half,
    /// [`WORD_SIZE`](crate::instruction::WORD_SIZE) bytes, little-endian.
    Word,
}

impl Width {
    /// Encoded size in bytes.
    pub fn size(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => crate::instruction::WORD_SIZE,
        }
    }
}

macro_rules! opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $byte:literal, $mnemonic:literal, [$($width:ident),*], $reverse:literal;
        )*
    ) => {
        /// Identifies the operation to perform.
        ///
        /// The `#[repr(u8)]` attribute keeps each variant's byte value stable.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $byte,
            )*
        }

        /// All valid opcodes, in definition order.
        pub const ALL_OPCODES: &[Opcode] = &[$(Opcode::$name,)*];

        impl TryFrom<u8> for Opcode {
            type Error = DecodeError;

            fn try_from(value: u8) -> Result<Self, DecodeError> {
                match value {
                    $($byte => Ok(Opcode::$name),)*
                    _ => Err(DecodeError::UnknownOpcode(value)),
                }
            }
        }

        impl Opcode {
            /// Returns the assembly mnemonic for this opcode.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            /// Operand widths, in encoding order.
            pub fn operands(self) -> &'static [Width] {
                match self {
                    $(Opcode::$name => &[$(Width::$width),*],)*
                }
            }

            /// True for opcodes that may appear in replayed reverse code.
            pub fn is_reverse(self) -> bool {
                match self {
                    $(Opcode::$name => $reverse,)*
                }
            }
        }
    };
}

opcodes! {
    // ---- Loads
    LoadNil = 0x01, "LOAD_NIL", [], false;
    LoadTrue = 0x02, "LOAD_TRUE", [], false;
    LoadFalse = 0x03, "LOAD_FALSE", [], false;
    /// Push a fresh Int tree.
    LoadInt = 0x04, "LOAD_INT", [Word], false;
    /// Push a fresh Str tree built from the literal table.
    LoadStr = 0x05, "LOAD_STR", [Half], false;
    /// Push a raw word. Used by reverse code to restore counters.
    LoadWord = 0x06, "LOAD_WORD", [Word], true;
    /// Push a tree captured in reverse code, taking over the captured reference.
    LoadTree = 0x07, "LOAD_TREE", [Word], true;
    LoadGlobalR = 0x08, "LOAD_GLOBAL_R", [], false;
    LoadGlobalWv = 0x09, "LOAD_GLOBAL_WV", [], false;
    LoadGlobalWc = 0x0A, "LOAD_GLOBAL_WC", [], false;
    LoadGlobalBkt = 0x0B, "LOAD_GLOBAL_BKT", [], true;
    LoadContextR = 0x0C, "LOAD_CONTEXT_R", [], false;
    LoadContextWv = 0x0D, "LOAD_CONTEXT_WV", [], false;
    LoadContextWc = 0x0E, "LOAD_CONTEXT_WC", [], false;
    LoadContextBkt = 0x0F, "LOAD_CONTEXT_BKT", [], true;
    LoadAccumR = 0x10, "LOAD_ACCUM_R", [], false;
    LoadAccumWv = 0x11, "LOAD_ACCUM_WV", [], false;
    LoadAccumWc = 0x12, "LOAD_ACCUM_WC", [], false;
    LoadAccumBkt = 0x13, "LOAD_ACCUM_BKT", [Word], true;
    /// Build a list of the program arguments and store it in a global field.
    LoadArgv = 0x14, "LOAD_ARGV", [Half], false;
    GetStdin = 0x15, "GET_STDIN", [], false;
    /// Pop mode and name strings, push a stream over the file or nil.
    OpenFile = 0x16, "OPEN_FILE", [], false;

    // ---- Stack
    Pop = 0x20, "POP", [], false;
    PopNWords = 0x21, "POP_N_WORDS", [Half], false;
    DupTop = 0x22, "DUP_TOP", [], false;
    DupTopOff = 0x23, "DUP_TOP_OFF", [Half], false;

    // ---- Jumps (signed distance from the end of the instruction)
    Jmp = 0x28, "JMP", [Half], false;
    JmpFalse = 0x29, "JMP_FALSE", [Half], false;
    JmpTrue = 0x2A, "JMP_TRUE", [Half], false;

    // ---- Tests
    TstEql = 0x30, "TST_EQL", [], false;
    TstNotEql = 0x31, "TST_NOT_EQL", [], false;
    TstLess = 0x32, "TST_LESS", [], false;
    TstLessEql = 0x33, "TST_LESS_EQL", [], false;
    TstGrtr = 0x34, "TST_GRTR", [], false;
    TstGrtrEql = 0x35, "TST_GRTR_EQL", [], false;
    TstLogicalAnd = 0x36, "TST_LOGICAL_AND", [], false;
    TstLogicalOr = 0x37, "TST_LOGICAL_OR", [], false;
    Not = 0x38, "NOT", [], false;

    // ---- Arithmetic
    AddInt = 0x3A, "ADD_INT", [], false;
    SubInt = 0x3B, "SUB_INT", [], false;
    MultInt = 0x3C, "MULT_INT", [], false;
    /// Division by zero is a runtime error.
    DivInt = 0x3D, "DIV_INT", [], false;

    // ---- Strings and output
    ConcatStr = 0x40, "CONCAT_STR", [], false;
    StrLength = 0x41, "STR_LENGTH", [], false;
    StrAtoi = 0x42, "STR_ATOI", [], false;
    IntToStr = 0x43, "INT_TO_STR", [], false;
    TreeToStr = 0x44, "TREE_TO_STR", [], false;
    StrUord8 = 0x45, "STR_UORD8", [], false;
    StrUord16 = 0x46, "STR_UORD16", [], false;
    ToUpper = 0x47, "TO_UPPER", [], false;
    ToLower = 0x48, "TO_LOWER", [], false;
    /// Pop an Int and a format Str with one `%d`, `%x`, `%s` or `%%` directive.
    Sprintf = 0x49, "SPRINTF", [], false;
    /// Pop `n` trees and write their text to the output sink.
    Print = 0x4C, "PRINT", [Byte], false;

    // ---- Locals
    InitLocals = 0x50, "INIT_LOCALS", [Half], false;
    PopLocals = 0x51, "POP_LOCALS", [Half, Half], false;
    GetLocalR = 0x52, "GET_LOCAL_R", [Half], false;
    GetLocalWc = 0x53, "GET_LOCAL_WC", [Half], false;
    SetLocalWc = 0x54, "SET_LOCAL_WC", [Half], false;
    /// Move the top of stack into the frame's return-value slot.
    SaveRet = 0x55, "SAVE_RET", [], false;
    GetLocalRefR = 0x56, "GET_LOCAL_REF_R", [Half], false;
    GetLocalRefWc = 0x57, "GET_LOCAL_REF_WC", [Half], false;
    SetLocalRefWc = 0x58, "SET_LOCAL_REF_WC", [Half], false;

    // ---- References
    RefFromLocal = 0x5A, "REF_FROM_LOCAL", [Half], false;
    RefFromRef = 0x5B, "REF_FROM_REF", [Half], false;
    RefFromQualRef = 0x5C, "REF_FROM_QUAL_REF", [Half, Half], false;
    TriterRefFromCur = 0x5D, "TRITER_REF_FROM_CUR", [Half], false;
    UiterRefFromCur = 0x5E, "UITER_REF_FROM_CUR", [Half], false;

    // ---- Fields
    GetFieldR = 0x60, "GET_FIELD_R", [Half], false;
    GetFieldWc = 0x61, "GET_FIELD_WC", [Half], false;
    GetFieldWv = 0x62, "GET_FIELD_WV", [Half], false;
    GetFieldBkt = 0x63, "GET_FIELD_BKT", [Half], true;
    SetFieldWc = 0x64, "SET_FIELD_WC", [Half], false;
    SetFieldWv = 0x65, "SET_FIELD_WV", [Half], false;
    /// Restore a field to its captured previous value.
    SetFieldBkt = 0x66, "SET_FIELD_BKT", [Half, Word], true;
    /// Set a field and leave the assigned value on the stack.
    SetFieldLeaveWc = 0x67, "SET_FIELD_LEAVE_WC", [Half], false;

    // ---- Pointers
    TreeNew = 0x68, "TREE_NEW", [], false;
    PtrDerefR = 0x69, "PTR_DEREF_R", [], false;
    PtrDerefWc = 0x6A, "PTR_DEREF_WC", [], false;
    PtrDerefWv = 0x6B, "PTR_DEREF_WV", [], false;
    PtrDerefBkt = 0x6C, "PTR_DEREF_BKT", [Word], true;

    // ---- Token data
    GetTokenDataR = 0x70, "GET_TOKEN_DATA_R", [], false;
    SetTokenDataWc = 0x71, "SET_TOKEN_DATA_WC", [], false;
    SetTokenDataWv = 0x72, "SET_TOKEN_DATA_WV", [], false;
    SetTokenDataBkt = 0x73, "SET_TOKEN_DATA_BKT", [Word], true;
    GetTokenPosR = 0x74, "GET_TOKEN_POS_R", [], false;
    GetMatchLengthR = 0x75, "GET_MATCH_LENGTH_R", [], false;
    GetMatchTextR = 0x76, "GET_MATCH_TEXT_R", [], false;

    // ---- Construction
    /// Construct a childless token tree of the given id.
    ConstructTerm = 0x78, "CONSTRUCT_TERM", [Half], false;
    /// Pop `n` values: id, text, then attributes.
    MakeToken = 0x79, "MAKE_TOKEN", [Byte], false;
    /// Pop `n` values: id, then children.
    MakeTree = 0x7A, "MAKE_TREE", [Byte], false;
    ConsList = 0x7B, "CONS_LIST", [Half], false;
    ConsMap = 0x7C, "CONS_MAP", [Half], false;
    /// Build an accumulator around a fresh driver from the parser registry.
    ConsParser = 0x7D, "CONS_PARSER", [Half], false;
    TreeSearch = 0x7E, "TREE_SEARCH", [Word], false;

    // ---- Lists
    ListLength = 0x80, "LIST_LENGTH", [], false;
    ListAppendWv = 0x81, "LIST_APPEND_WV", [], false;
    ListAppendWc = 0x82, "LIST_APPEND_WC", [], false;
    ListAppendBkt = 0x83, "LIST_APPEND_BKT", [], true;
    ListRemoveEndWv = 0x84, "LIST_REMOVE_END_WV", [], false;
    ListRemoveEndWc = 0x85, "LIST_REMOVE_END_WC", [], false;
    ListRemoveEndBkt = 0x86, "LIST_REMOVE_END_BKT", [Word], true;
    GetListMemR = 0x87, "GET_LIST_MEM_R", [Half], false;
    GetListMemWc = 0x88, "GET_LIST_MEM_WC", [Half], false;
    GetListMemWv = 0x89, "GET_LIST_MEM_WV", [Half], false;
    GetListMemBkt = 0x8A, "GET_LIST_MEM_BKT", [Half], true;
    SetListMemWc = 0x8B, "SET_LIST_MEM_WC", [Half], false;
    SetListMemWv = 0x8C, "SET_LIST_MEM_WV", [Half], false;
    SetListMemBkt = 0x8D, "SET_LIST_MEM_BKT", [Half, Word], true;

    // ---- Maps
    MapLength = 0x90, "MAP_LENGTH", [], false;
    MapFind = 0x91, "MAP_FIND", [], false;
    MapInsertWv = 0x92, "MAP_INSERT_WV", [], false;
    MapInsertWc = 0x93, "MAP_INSERT_WC", [], false;
    /// Operands: inserted flag, captured key.
    MapInsertBkt = 0x94, "MAP_INSERT_BKT", [Byte, Word], true;
    MapStoreWv = 0x95, "MAP_STORE_WV", [], false;
    MapStoreWc = 0x96, "MAP_STORE_WC", [], false;
    /// Operands: captured key, previous value (nil when the key was new).
    MapStoreBkt = 0x97, "MAP_STORE_BKT", [Word, Word], true;
    MapRemoveWv = 0x98, "MAP_REMOVE_WV", [], false;
    MapRemoveWc = 0x99, "MAP_REMOVE_WC", [], false;
    MapRemoveBkt = 0x9A, "MAP_REMOVE_BKT", [Word, Word], true;

    // ---- Tree iterators
    TriterFromRef = 0xA0, "TRITER_FROM_REF", [Half, Half], false;
    TriterAdvance = 0xA1, "TRITER_ADVANCE", [Half], false;
    TriterNextChild = 0xA2, "TRITER_NEXT_CHILD", [Half], false;
    TriterGetCurR = 0xA3, "TRITER_GET_CUR_R", [Half], false;
    TriterGetCurWc = 0xA4, "TRITER_GET_CUR_WC", [Half], false;
    TriterSetCurWc = 0xA5, "TRITER_SET_CUR_WC", [Half], false;
    TriterDestroy = 0xA6, "TRITER_DESTROY", [Half], false;

    // ---- User iterators
    /// Operands: argument size, function id, search id.
    UiterCreateWv = 0xA8, "UITER_CREATE_WV", [Half, Half, Half], false;
    UiterCreateWc = 0xA9, "UITER_CREATE_WC", [Half, Half, Half], false;
    UiterAdvance = 0xAA, "UITER_ADVANCE", [Half], false;
    UiterGetCurR = 0xAB, "UITER_GET_CUR_R", [Half], false;
    UiterGetCurWc = 0xAC, "UITER_GET_CUR_WC", [Half], false;
    UiterSetCurWc = 0xAD, "UITER_SET_CUR_WC", [Half], false;
    UiterDestroy = 0xAE, "UITER_DESTROY", [Half], false;
    Yield = 0xAF, "YIELD", [], false;

    // ---- Calls
    CallWv = 0xB0, "CALL_WV", [Half], false;
    CallWc = 0xB1, "CALL_WC", [Half], false;
    Ret = 0xB2, "RET", [Half], false;

    // ---- Reductions
    InitRhsEl = 0xB4, "INIT_RHS_EL", [Half, Half], false;
    InitLhsEl = 0xB5, "INIT_LHS_EL", [Half, Byte], false;
    StoreLhsEl = 0xB6, "STORE_LHS_EL", [Half], false;
    RestoreLhs = 0xB7, "RESTORE_LHS", [Word], true;
    Reject = 0xB8, "REJECT", [], false;

    // ---- Streams
    ConsAccumStream = 0xC0, "CONS_ACCUM_STREAM", [], false;
    GetAccumStream = 0xC1, "GET_ACCUM_STREAM", [], false;
    GetAccumCtxR = 0xC2, "GET_ACCUM_CTX_R", [], false;
    SetAccumCtxWc = 0xC3, "SET_ACCUM_CTX_WC", [], false;
    StreamAppendWc = 0xC4, "STREAM_APPEND_WC", [], false;
    StreamAppendWv = 0xC5, "STREAM_APPEND_WV", [], false;
    /// Operands: target, appended value, length of appended text.
    StreamAppendBkt = 0xC6, "STREAM_APPEND_BKT", [Word, Word, Word], true;
    StreamPullWc = 0xC7, "STREAM_PULL_WC", [], false;
    StreamPullWv = 0xC8, "STREAM_PULL_WV", [], false;
    StreamPullBkt = 0xC9, "STREAM_PULL_BKT", [Word], true;
    StreamPushWc = 0xCA, "STREAM_PUSH_WC", [], false;
    StreamPushWv = 0xCB, "STREAM_PUSH_WV", [], false;
    StreamPushIgnoreWc = 0xCC, "STREAM_PUSH_IGNORE_WC", [], false;
    StreamPushIgnoreWv = 0xCD, "STREAM_PUSH_IGNORE_WV", [], false;
    /// Operand: pushed length, or all ones when a tree was pushed.
    StreamPushBkt = 0xCE, "STREAM_PUSH_BKT", [Word], true;

    // ---- Parse continuations
    ParseSaveSteps = 0xD0, "PARSE_SAVE_STEPS", [], false;
    ParseLoadStart = 0xD1, "PARSE_LOAD_START", [], true;
    /// Run the pending reduction or reverse block of the accumulator under the PCR.
    PcrCall = 0xD2, "PCR_CALL", [], true;
    PcrRet = 0xD3, "PCR_RET", [], true;
    PcrEndDeck = 0xD4, "PCR_END_DECK", [], true;
    ParseFragWc = 0xD5, "PARSE_FRAG_WC", [Half], false;
    ParseFragWc3 = 0xD6, "PARSE_FRAG_WC3", [], false;
    ParseFragWv = 0xD7, "PARSE_FRAG_WV", [Half], false;
    ParseFragWv3 = 0xD8, "PARSE_FRAG_WV3", [], false;
    ParseFragBkt = 0xD9, "PARSE_FRAG_BKT", [Half], true;
    ParseFragBkt3 = 0xDA, "PARSE_FRAG_BKT3", [], true;
    ParseFinishWc = 0xDB, "PARSE_FINISH_WC", [Half], false;
    ParseFinishWc3 = 0xDC, "PARSE_FINISH_WC3", [], false;
    ParseFinishWv = 0xDD, "PARSE_FINISH_WV", [Half], false;
    ParseFinishWv3 = 0xDE, "PARSE_FINISH_WV3", [], false;
    ParseFinishBkt = 0xDF, "PARSE_FINISH_BKT", [Half], true;
    ParseFinishBkt3 = 0xE0, "PARSE_FINISH_BKT3", [], true;

    // ---- Program control
    /// Pop the status Int and unwind every level of execution.
    Exit = 0xF0, "EXIT", [], false;
    /// Push the last parse error, or nil.
    Error = 0xF1, "ERROR", [], false;
    Stop = 0xF2, "STOP", [], true;
    /// Marks code the compiler must never reach.
    Halt = 0xFE, "HALT", [], false;
}

impl Opcode {
    /// Look an opcode up by its assembly mnemonic.
    pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
        ALL_OPCODES
            .iter()
            .copied()
            .find(|op| op.mnemonic() == mnemonic)
    }

    /// Encoded size of an instruction with this opcode, in bytes.
    pub fn encoded_len(self) -> usize {
        1 + self.operands().iter().map(|w| w.size()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn roundtrip_all_valid_opcodes() {
        for &opcode in ALL_OPCODES {
            let byte = opcode as u8;
            let decoded = Opcode::try_from(byte).unwrap();
            assert_eq!(
                opcode, decoded,
                "roundtrip failed for {opcode:?} ({byte:#04x})"
            );
        }
    }

    #[test]
    fn zero_is_not_an_opcode() {
        assert_eq!(Opcode::try_from(0x00), Err(DecodeError::UnknownOpcode(0)));
    }

    #[test]
    fn gaps_are_rejected() {
        for byte in [0x17u8, 0x2B, 0x39, 0x4A, 0x59, 0x9B, 0xB3, 0xE1, 0xFF] {
            assert_eq!(
                Opcode::try_from(byte),
                Err(DecodeError::UnknownOpcode(byte)),
                "byte {byte:#04x} should be unassigned"
            );
        }
    }

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = HashSet::new();
        for &op in ALL_OPCODES {
            assert!(seen.insert(op.mnemonic()), "duplicate {}", op.mnemonic());
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
        }
    }

    #[test]
    fn operands_fit_instruction_args() {
        for &op in ALL_OPCODES {
            assert!(op.operands().len() <= 3, "{op:?} has too many operands");
        }
    }

    #[test]
    fn every_bkt_opcode_is_reverse() {
        for &op in ALL_OPCODES {
            if op.mnemonic().ends_with("_BKT") || op.mnemonic().ends_with("_BKT3") {
                assert!(op.is_reverse(), "{op:?} must be allowed in reverse code");
            }
        }
        assert!(!Opcode::SetFieldWv.is_reverse());
        assert!(Opcode::PcrRet.is_reverse());
    }

    #[test]
    fn encoded_lengths() {
        assert_eq!(Opcode::LoadNil.encoded_len(), 1);
        assert_eq!(Opcode::Jmp.encoded_len(), 3);
        assert_eq!(Opcode::SetFieldBkt.encoded_len(), 11);
        assert_eq!(Opcode::StreamAppendBkt.encoded_len(), 25);
    }
}
