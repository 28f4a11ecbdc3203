//! sprig assembler: text ↔ bytecode.
//!
//! The assembler is a mechanical translation with labels. No optimization,
//! no macros. It exists to write test programs and to read code back.
//!
//! # Usage
//!
//! ```
//! use sprig_asm::{assemble, disassemble};
//!
//! let program = assemble("LOAD_INT 3\nLOAD_INT 4\nADD_INT\nPOP\nSTOP\n").unwrap();
//! let text = disassemble(&program.code).unwrap();
//! assert!(text.starts_with("0000: LOAD_INT 3\n"));
//! assert_eq!(assemble(&text).unwrap().code, program.code);
//! ```
//!
//! # Syntax
//!
//! - One instruction per line: `MNEMONIC operand*`. `;` starts a comment.
//! - `name:` defines a label at the next instruction.
//! - `@name` is a label reference. For a jump it becomes the signed
//!   distance from the end of the jump; anywhere else it is the absolute
//!   offset.
//! - Directives fill the program tables:
//!   `.globals N`, `.literal "text"`, `.root`, `.any ID`,
//!   `.frame ID name wv=@l wc=@l trees=a,b`,
//!   `.function ID name frame=F args=A size=S`.

pub mod error;

mod disassembler;
mod lexer;
mod parser;

pub use error::AsmError;

use std::collections::HashMap;

use lexer::tokenize_line;
use parser::{parse_line, Directive, Item, Line, Operand};
use sprig_common::{CodeWriter, FrameInfo, FunctionInfo, Opcode, Program};

/// Assemble text into a program.
///
/// Returns the first error encountered.
pub fn assemble(text: &str) -> Result<Program, AsmError> {
    // Pass 1: parse every line and place labels.
    let mut lines: Vec<(usize, Line)> = Vec::new();
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut offset = 0;
    for (idx, raw) in text.lines().enumerate() {
        let line_num = idx + 1;
        let line = parse_line(&tokenize_line(raw, line_num)?, line_num)?;
        if let Some(label) = &line.label {
            if labels.insert(label.clone(), offset).is_some() {
                return Err(AsmError::DuplicateLabel {
                    line: line_num,
                    label: label.clone(),
                });
            }
        }
        if let Some(Item::Instr { opcode, .. }) = &line.item {
            offset += opcode.encoded_len();
        }
        lines.push((line_num, line));
    }

    // Pass 2: emit code and fill the tables.
    let mut w = CodeWriter::new();
    let mut program = Program::new(Vec::new());
    for (line_num, line) in lines {
        match line.item {
            None => {}
            Some(Item::Instr { opcode, operands }) => {
                let end = w.len() + opcode.encoded_len();
                let values = operands
                    .iter()
                    .map(|op| resolve(op, opcode, end, &labels, line_num))
                    .collect::<Result<Vec<_>, _>>()?;
                w.emit(opcode, &values);
            }
            Some(Item::Directive(directive)) => {
                apply_directive(&mut program, directive, w.len(), &labels, line_num)?;
            }
        }
    }
    program.code = w.into_bytes();
    Ok(program)
}

/// Disassemble code into text, one instruction per line.
pub fn disassemble(code: &[u8]) -> Result<String, AsmError> {
    disassembler::disassemble(code)
}

fn resolve(
    operand: &Operand,
    opcode: Opcode,
    end: usize,
    labels: &HashMap<String, usize>,
    line: usize,
) -> Result<u64, AsmError> {
    let label = match operand {
        Operand::Value(v) => return Ok(*v),
        Operand::Label(label) => label,
    };
    let target = lookup(label, labels, line)?;
    if disassembler::is_jump(opcode) {
        let dist = target as i64 - end as i64;
        let dist = i16::try_from(dist).map_err(|_| AsmError::JumpOutOfRange {
            line,
            label: label.clone(),
        })?;
        Ok(dist as u16 as u64)
    } else {
        Ok(target as u64)
    }
}

fn lookup(label: &str, labels: &HashMap<String, usize>, line: usize) -> Result<usize, AsmError> {
    labels.get(label).copied().ok_or_else(|| AsmError::UndefinedLabel {
        line,
        label: label.to_string(),
    })
}

fn absolute(operand: &Operand, labels: &HashMap<String, usize>, line: usize) -> Result<usize, AsmError> {
    match operand {
        Operand::Value(v) => Ok(*v as usize),
        Operand::Label(label) => lookup(label, labels, line),
    }
}

fn apply_directive(
    program: &mut Program,
    directive: Directive,
    here: usize,
    labels: &HashMap<String, usize>,
    line: usize,
) -> Result<(), AsmError> {
    match directive {
        Directive::Globals(n) => program.global_size = n,
        Directive::Literal(text) => program.literals.push(text),
        Directive::Root => program.root_code = here,
        Directive::Any(id) => program.any_id = id,
        Directive::Frame {
            id,
            name,
            wv,
            wc,
            trees,
        } => {
            let frame = FrameInfo {
                name,
                code_wv: absolute(&wv, labels, line)?,
                code_wc: absolute(&wc, labels, line)?,
                trees,
            };
            place(&mut program.frames, id, frame);
        }
        Directive::Function {
            id,
            name,
            frame,
            args,
            size,
        } => {
            let function = FunctionInfo {
                name,
                frame_id: frame,
                arg_size: args,
                frame_size: size,
            };
            place(&mut program.functions, id, function);
        }
    }
    Ok(())
}

/// Tables are indexed by id; gaps are filled with defaults.
fn place<T: Default>(table: &mut Vec<T>, id: u16, value: T) {
    let id = id as usize;
    if table.len() <= id {
        table.resize_with(id + 1, T::default);
    }
    table[id] = value;
}
