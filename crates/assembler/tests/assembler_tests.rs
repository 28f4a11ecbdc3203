//! Integration tests for the sprig assembler.
//!
//! Tests cover:
//! - Whole programs with frames, functions and literals
//! - Disassembler output reassembling to identical bytes
//! - Every opcode surviving a text round trip
//! - Error cases with line numbers

use sprig_asm::{assemble, disassemble, AsmError};
use sprig_common::{Instruction, Opcode, Width, ALL_OPCODES};

const CALL_PROGRAM: &str = "\
; double(x) = x + x
.literal \"result: \"
double:
    INIT_LOCALS 0
    GET_LOCAL_R -5
    GET_LOCAL_R -5
    ADD_INT
    SAVE_RET
    RET 0
.frame 0 double wv=@double wc=@double
.function 0 double frame=0 args=1 size=0

.root
    LOAD_INT 21
    CALL_WC 0
    LOAD_STR 0
    PRINT 1
    PRINT 1
    STOP
";

#[test]
fn program_with_call() {
    let program = assemble(CALL_PROGRAM).unwrap();
    assert_eq!(program.functions.len(), 1);
    assert_eq!(program.frames[0].code_wv, 0);
    assert_eq!(program.literal(0), Some(&b"result: "[..]));
    let (first_root, _) = Instruction::decode(&program.code, program.root_code).unwrap();
    assert_eq!(first_root.opcode, Opcode::LoadInt);
}

#[test]
fn disassembly_reassembles_to_same_code() {
    let program = assemble(CALL_PROGRAM).unwrap();
    let text = disassemble(&program.code).unwrap();
    let again = assemble(&text).unwrap();
    assert_eq!(again.code, program.code);
}

#[test]
fn loop_reassembles_with_jump_comments() {
    let text = "\
    LOAD_INT 3
top:
    DUP_TOP
    LOAD_INT 0
    TST_GRTR
    JMP_FALSE @out
    LOAD_INT 1
    SUB_INT
    JMP @top
out:
    POP
    STOP
";
    let program = assemble(text).unwrap();
    let listing = disassemble(&program.code).unwrap();
    assert!(listing.contains("JMP -"), "{listing}");
    assert_eq!(assemble(&listing).unwrap().code, program.code);
}

#[test]
fn every_opcode_round_trips() {
    for &op in ALL_OPCODES {
        let operands: Vec<String> = op
            .operands()
            .iter()
            .map(|w| match w {
                Width::Byte => "7".to_string(),
                Width::Half => "300".to_string(),
                Width::Word => "70000".to_string(),
            })
            .collect();
        let line = format!("{} {}\n", op.mnemonic(), operands.join(" "));
        let program = assemble(&line).unwrap_or_else(|e| panic!("{line}: {e}"));
        assert_eq!(program.code.len(), op.encoded_len(), "{line}");
        let listing = disassemble(&program.code).unwrap();
        assert_eq!(assemble(&listing).unwrap().code, program.code, "{listing}");
    }
}

#[test]
fn lowercase_mnemonics_are_accepted() {
    assert_eq!(
        assemble("load_int 1\npop\n").unwrap().code,
        assemble("LOAD_INT 1\nPOP\n").unwrap().code
    );
}

#[test]
fn missing_operand_reports_line() {
    let err = assemble("STOP\nGET_FIELD_R\n").unwrap_err();
    assert_eq!(
        err,
        AsmError::MissingArgument {
            line: 2,
            opcode: "GET_FIELD_R",
            expected: 1
        }
    );
}

#[test]
fn frame_with_undefined_label() {
    let err = assemble(".frame 0 f wv=@missing\n").unwrap_err();
    assert!(matches!(err, AsmError::UndefinedLabel { line: 1, .. }));
}

#[test]
fn truncated_code_does_not_disassemble() {
    let program = assemble("LOAD_INT 5\n").unwrap();
    let err = disassemble(&program.code[..4]).unwrap_err();
    assert!(matches!(err, AsmError::Decode(_)));
}
