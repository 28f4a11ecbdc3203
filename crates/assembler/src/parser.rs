//! Parser for sprig assembly tokens: instructions, labels and directives.
//!
//! Operands are checked against the opcode's declared widths here; label
//! references are left symbolic and resolved by the second pass.

use crate::error::AsmError;
use crate::lexer::Token;
use sprig_common::{Opcode, Width};

/// One instruction operand before label resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operand {
    Value(u64),
    Label(String),
}

/// Table and layout directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Directive {
    Globals(u16),
    Literal(Vec<u8>),
    /// The root code starts at the next instruction.
    Root,
    Any(u16),
    Frame {
        id: u16,
        name: String,
        wv: Operand,
        wc: Operand,
        trees: Vec<i16>,
    },
    Function {
        id: u16,
        name: String,
        frame: u16,
        args: u16,
        size: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Item {
    Instr { opcode: Opcode, operands: Vec<Operand> },
    Directive(Directive),
}

/// A parsed line: an optional label followed by an optional item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Line {
    pub label: Option<String>,
    pub item: Option<Item>,
}

/// Parse the tokens of one line.
pub(crate) fn parse_line(tokens: &[Token], line: usize) -> Result<Line, AsmError> {
    let mut rest = tokens;
    if let Some(Token::Offset(_)) = rest.first() {
        rest = &rest[1..];
    }
    let mut parsed = Line::default();
    if let Some(Token::Label(name)) = rest.first() {
        parsed.label = Some(name.clone());
        rest = &rest[1..];
    }
    let Some(first) = rest.first() else {
        return Ok(parsed);
    };
    let args = &rest[1..];

    parsed.item = Some(match first {
        Token::Ident(mnemonic) => {
            let opcode = Opcode::from_mnemonic(&mnemonic.to_uppercase()).ok_or_else(|| AsmError::UnknownOpcode {
                line,
                token: mnemonic.clone(),
            })?;
            Item::Instr {
                opcode,
                operands: parse_operands(opcode, args, line)?,
            }
        }
        Token::Directive(name) => Item::Directive(parse_directive(name, args, line)?),
        other => return Err(unexpected(other, line)),
    });
    Ok(parsed)
}

fn parse_operands(opcode: Opcode, args: &[Token], line: usize) -> Result<Vec<Operand>, AsmError> {
    let widths = opcode.operands();
    if args.len() < widths.len() {
        return Err(AsmError::MissingArgument {
            line,
            opcode: opcode.mnemonic(),
            expected: widths.len(),
        });
    }
    expect_end(&args[widths.len()..], line)?;

    widths
        .iter()
        .zip(args)
        .map(|(width, tok)| match tok {
            Token::Number(n) => {
                check_width(*n, *width, line)?;
                Ok(Operand::Value(*n))
            }
            Token::LabelRef(name) => Ok(Operand::Label(name.clone())),
            other => Err(unexpected(other, line)),
        })
        .collect()
}

/// A value fits a half when it is a u16 or a negative i16.
fn check_width(n: u64, width: Width, line: usize) -> Result<(), AsmError> {
    let fits = match width {
        Width::Byte => n <= u8::MAX as u64,
        Width::Half => n <= u16::MAX as u64 || (i16::MIN as i64..0).contains(&(n as i64)),
        Width::Word => true,
    };
    if fits {
        Ok(())
    } else {
        Err(AsmError::InvalidNumber {
            line,
            token: (n as i64).to_string(),
        })
    }
}

fn parse_directive(name: &str, args: &[Token], line: usize) -> Result<Directive, AsmError> {
    let bad = |detail: &str| AsmError::BadDirective {
        line,
        detail: format!(".{name}: {detail}"),
    };
    match name {
        "globals" => {
            let n = expect_u16(args, 0, line).map_err(|_| bad("expected a slot count"))?;
            expect_end(&args[1..], line)?;
            Ok(Directive::Globals(n))
        }
        "literal" => match args {
            [Token::Str(text)] => Ok(Directive::Literal(text.clone())),
            _ => Err(bad("expected one string")),
        },
        "root" => {
            expect_end(args, line)?;
            Ok(Directive::Root)
        }
        "any" => {
            let id = expect_u16(args, 0, line).map_err(|_| bad("expected a type id"))?;
            expect_end(&args[1..], line)?;
            Ok(Directive::Any(id))
        }
        "frame" => {
            let id = expect_u16(args, 0, line).map_err(|_| bad("expected a frame id"))?;
            let name = expect_name(args, 1).ok_or_else(|| bad("expected a frame name"))?;
            let mut wv = None;
            let mut wc = None;
            let mut trees = Vec::new();
            for tok in &args[2..] {
                let Token::Pair(key, values) = tok else {
                    return Err(unexpected(tok, line));
                };
                match (key.as_str(), values.as_slice()) {
                    ("wv", [v]) => wv = Some(operand(v, line)?),
                    ("wc", [v]) => wc = Some(operand(v, line)?),
                    ("trees", values) => {
                        for v in values {
                            let Token::Number(n) = v else {
                                return Err(unexpected(v, line));
                            };
                            check_width(*n, Width::Half, line)?;
                            trees.push(*n as u16 as i16);
                        }
                    }
                    _ => return Err(bad(&format!("unknown key '{key}'"))),
                }
            }
            let wv = wv.ok_or_else(|| bad("missing wv="))?;
            let wc = wc.unwrap_or_else(|| wv.clone());
            Ok(Directive::Frame {
                id,
                name,
                wv,
                wc,
                trees,
            })
        }
        "function" => {
            let id = expect_u16(args, 0, line).map_err(|_| bad("expected a function id"))?;
            let name = expect_name(args, 1).ok_or_else(|| bad("expected a function name"))?;
            let (mut frame, mut fargs, mut size) = (None, 0, 0);
            for tok in &args[2..] {
                let Token::Pair(key, values) = tok else {
                    return Err(unexpected(tok, line));
                };
                let value = match values.as_slice() {
                    [Token::Number(n)] if *n <= u16::MAX as u64 => *n as u16,
                    _ => return Err(bad(&format!("{key}= needs a number"))),
                };
                match key.as_str() {
                    "frame" => frame = Some(value),
                    "args" => fargs = value,
                    "size" => size = value,
                    _ => return Err(bad(&format!("unknown key '{key}'"))),
                }
            }
            Ok(Directive::Function {
                id,
                name,
                frame: frame.ok_or_else(|| bad("missing frame="))?,
                args: fargs,
                size,
            })
        }
        _ => Err(bad("unknown directive")),
    }
}

fn operand(tok: &Token, line: usize) -> Result<Operand, AsmError> {
    match tok {
        Token::Number(n) => Ok(Operand::Value(*n)),
        Token::LabelRef(name) => Ok(Operand::Label(name.clone())),
        other => Err(unexpected(other, line)),
    }
}

fn expect_u16(args: &[Token], idx: usize, line: usize) -> Result<u16, AsmError> {
    match args.get(idx) {
        Some(Token::Number(n)) if *n <= u16::MAX as u64 => Ok(*n as u16),
        Some(other) => Err(unexpected(other, line)),
        None => Err(AsmError::BadDirective {
            line,
            detail: "missing operand".to_string(),
        }),
    }
}

fn expect_name(args: &[Token], idx: usize) -> Option<String> {
    match args.get(idx) {
        Some(Token::Ident(name)) => Some(name.clone()),
        _ => None,
    }
}

/// Check that there are no extra tokens.
fn expect_end(remaining: &[Token], line: usize) -> Result<(), AsmError> {
    match remaining.first() {
        Some(tok) => Err(unexpected(tok, line)),
        None => Ok(()),
    }
}

fn unexpected(tok: &Token, line: usize) -> AsmError {
    let token = match tok {
        Token::Ident(s) => s.clone(),
        Token::Number(n) => n.to_string(),
        Token::Label(s) => format!("{s}:"),
        Token::LabelRef(s) => format!("@{s}"),
        Token::Directive(s) => format!(".{s}"),
        Token::Str(s) => format!("\"{}\"", String::from_utf8_lossy(s)),
        Token::Pair(k, _) => format!("{k}="),
        Token::Offset(n) => format!("{n}:"),
    };
    AsmError::UnexpectedToken { line, token }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize_line;

    fn parse(text: &str) -> Result<Line, AsmError> {
        parse_line(&tokenize_line(text, 1)?, 1)
    }

    #[test]
    fn blank_line() {
        assert_eq!(parse("").unwrap(), Line::default());
    }

    #[test]
    fn instruction_without_operands() {
        let line = parse("add_int").unwrap();
        assert_eq!(
            line.item,
            Some(Item::Instr {
                opcode: Opcode::AddInt,
                operands: vec![]
            })
        );
    }

    #[test]
    fn label_with_jump() {
        let line = parse("again: JMP_TRUE @again").unwrap();
        assert_eq!(line.label.as_deref(), Some("again"));
        assert_eq!(
            line.item,
            Some(Item::Instr {
                opcode: Opcode::JmpTrue,
                operands: vec![Operand::Label("again".to_string())]
            })
        );
    }

    #[test]
    fn offset_prefix_is_ignored() {
        let line = parse("0009: POP").unwrap();
        assert!(line.label.is_none());
        assert!(matches!(line.item, Some(Item::Instr { opcode: Opcode::Pop, .. })));
    }

    #[test]
    fn missing_operand() {
        let err = parse("SET_FIELD_BKT 1").unwrap_err();
        assert!(matches!(
            err,
            AsmError::MissingArgument {
                opcode: "SET_FIELD_BKT",
                expected: 2,
                ..
            }
        ));
    }

    #[test]
    fn extra_operand() {
        assert!(matches!(
            parse("POP 1").unwrap_err(),
            AsmError::UnexpectedToken { .. }
        ));
    }

    #[test]
    fn byte_operand_range() {
        assert!(parse("PRINT 255").is_ok());
        assert!(matches!(
            parse("PRINT 256").unwrap_err(),
            AsmError::InvalidNumber { .. }
        ));
    }

    #[test]
    fn half_accepts_negative_offsets() {
        assert!(parse("GET_LOCAL_R -3").is_ok());
        assert!(matches!(
            parse("GET_LOCAL_R -40000").unwrap_err(),
            AsmError::InvalidNumber { .. }
        ));
    }

    #[test]
    fn frame_directive() {
        let line = parse(".frame 2 body wv=@fwd wc=@fast trees=-1,2").unwrap();
        assert_eq!(
            line.item,
            Some(Item::Directive(Directive::Frame {
                id: 2,
                name: "body".to_string(),
                wv: Operand::Label("fwd".to_string()),
                wc: Operand::Label("fast".to_string()),
                trees: vec![-1, 2],
            }))
        );
    }

    #[test]
    fn frame_wc_defaults_to_wv() {
        let line = parse(".frame 0 f wv=@x").unwrap();
        let Some(Item::Directive(Directive::Frame { wv, wc, .. })) = line.item else {
            panic!("expected a frame");
        };
        assert_eq!(wv, wc);
    }

    #[test]
    fn function_directive() {
        let line = parse(".function 1 sum frame=3 args=2 size=1").unwrap();
        assert_eq!(
            line.item,
            Some(Item::Directive(Directive::Function {
                id: 1,
                name: "sum".to_string(),
                frame: 3,
                args: 2,
                size: 1,
            }))
        );
    }

    #[test]
    fn function_needs_frame() {
        assert!(matches!(
            parse(".function 1 sum args=2").unwrap_err(),
            AsmError::BadDirective { .. }
        ));
    }

    #[test]
    fn unknown_opcode() {
        assert_eq!(
            parse("FOOBAR").unwrap_err(),
            AsmError::UnknownOpcode {
                line: 1,
                token: "FOOBAR".to_string()
            }
        );
    }

    #[test]
    fn unknown_directive() {
        assert!(matches!(
            parse(".section text").unwrap_err(),
            AsmError::BadDirective { .. }
        ));
    }
}
