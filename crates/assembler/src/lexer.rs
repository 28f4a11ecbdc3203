//! Tokenizer for sprig assembly text.

use crate::error::AsmError;

/// A single token from an assembly line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// A bare word: mnemonic or name. Case is preserved.
    Ident(String),
    /// A numeric literal. Negative decimals are stored two's complement.
    Number(u64),
    /// `name:` at the start of a line.
    Label(String),
    /// `@name`, a reference to a label.
    LabelRef(String),
    /// `.name`
    Directive(String),
    /// A double-quoted string with escapes resolved.
    Str(Vec<u8>),
    /// `key=value[,value...]`
    Pair(String, Vec<Token>),
    /// `0012:`, an offset prefix as written by the disassembler.
    Offset(u64),
}

/// Tokenize a single line of assembly text.
///
/// Returns an empty Vec for blank lines and comment-only lines.
/// Comments start with `;` outside a string and extend to end of line.
pub(crate) fn tokenize_line(line: &str, line_num: usize) -> Result<Vec<Token>, AsmError> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == ';' {
            break;
        }
        if c == '"' {
            chars.next();
            tokens.push(Token::Str(read_string(&mut chars, line_num)?));
            continue;
        }
        let mut end = line.len();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || c == ';' {
                end = i;
                break;
            }
            chars.next();
        }
        tokens.push(word_token(&line[start..end], line_num)?);
    }

    Ok(tokens)
}

fn read_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    line: usize,
) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::new();
    loop {
        let Some((_, c)) = chars.next() else {
            return Err(AsmError::UnterminatedString { line });
        };
        match c {
            '"' => return Ok(out),
            '\\' => {
                let Some((_, e)) = chars.next() else {
                    return Err(AsmError::UnterminatedString { line });
                };
                match e {
                    'n' => out.push(b'\n'),
                    't' => out.push(b'\t'),
                    'r' => out.push(b'\r'),
                    '0' => out.push(0),
                    '\\' => out.push(b'\\'),
                    '"' => out.push(b'"'),
                    'x' => {
                        let hex: String = (0..2).filter_map(|_| chars.next().map(|(_, c)| c)).collect();
                        let byte = u8::from_str_radix(&hex, 16).map_err(|_| AsmError::InvalidNumber {
                            line,
                            token: format!("\\x{hex}"),
                        })?;
                        out.push(byte);
                    }
                    other => {
                        return Err(AsmError::UnexpectedToken {
                            line,
                            token: format!("\\{other}"),
                        })
                    }
                }
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn word_token(word: &str, line: usize) -> Result<Token, AsmError> {
    if let Some(name) = word.strip_prefix('@') {
        return Ok(Token::LabelRef(name.to_string()));
    }
    if let Some(name) = word.strip_prefix('.') {
        return Ok(Token::Directive(name.to_string()));
    }
    if let Some(name) = word.strip_suffix(':') {
        if name.bytes().all(|b| b.is_ascii_digit()) && !name.is_empty() {
            return parse_number(name, line).map(Token::Offset);
        }
        return Ok(Token::Label(name.to_string()));
    }
    if let Some((key, value)) = word.split_once('=') {
        let values = value
            .split(',')
            .filter(|v| !v.is_empty())
            .map(|v| word_token(v, line))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Token::Pair(key.to_string(), values));
    }
    if is_numeric(word) {
        return parse_number(word, line).map(Token::Number);
    }
    Ok(Token::Ident(word.to_string()))
}

fn is_numeric(word: &str) -> bool {
    let digits = word.strip_prefix('-').unwrap_or(word);
    digits.as_bytes().first().is_some_and(|b| b.is_ascii_digit())
}

fn parse_number(word: &str, line: usize) -> Result<u64, AsmError> {
    let invalid = || AsmError::InvalidNumber {
        line,
        token: word.to_string(),
    };
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| invalid());
    }
    if word.starts_with('-') {
        return word.parse::<i64>().map(|n| n as u64).map_err(|_| invalid());
    }
    word.parse::<u64>().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line() {
        assert_eq!(tokenize_line("", 1).unwrap(), vec![]);
    }

    #[test]
    fn comment_only() {
        assert_eq!(tokenize_line("   ; this is a comment", 1).unwrap(), vec![]);
    }

    #[test]
    fn instruction_with_comment() {
        assert_eq!(
            tokenize_line("LOAD_INT 42 ; answer", 1).unwrap(),
            vec![Token::Ident("LOAD_INT".to_string()), Token::Number(42)]
        );
    }

    #[test]
    fn label_and_jump() {
        assert_eq!(
            tokenize_line("top: JMP @top", 1).unwrap(),
            vec![
                Token::Label("top".to_string()),
                Token::Ident("JMP".to_string()),
                Token::LabelRef("top".to_string()),
            ]
        );
    }

    #[test]
    fn negative_and_hex_numbers() {
        assert_eq!(
            tokenize_line("GET_LOCAL_R -4 0x10", 1).unwrap(),
            vec![
                Token::Ident("GET_LOCAL_R".to_string()),
                Token::Number((-4i64) as u64),
                Token::Number(16),
            ]
        );
    }

    #[test]
    fn string_keeps_semicolons_and_escapes() {
        assert_eq!(
            tokenize_line(r#".literal "a; b\n\x41""#, 1).unwrap(),
            vec![
                Token::Directive("literal".to_string()),
                Token::Str(b"a; b\nA".to_vec()),
            ]
        );
    }

    #[test]
    fn pairs_split_on_commas() {
        assert_eq!(
            tokenize_line("trees=-1,-2 wv=@body", 1).unwrap(),
            vec![
                Token::Pair(
                    "trees".to_string(),
                    vec![Token::Number((-1i64) as u64), Token::Number((-2i64) as u64)]
                ),
                Token::Pair("wv".to_string(), vec![Token::LabelRef("body".to_string())]),
            ]
        );
    }

    #[test]
    fn offset_prefix() {
        assert_eq!(
            tokenize_line("0012: POP", 1).unwrap(),
            vec![Token::Offset(12), Token::Ident("POP".to_string())]
        );
    }

    #[test]
    fn unterminated_string() {
        assert_eq!(
            tokenize_line(r#".literal "abc"#, 4).unwrap_err(),
            AsmError::UnterminatedString { line: 4 }
        );
    }

    #[test]
    fn invalid_number() {
        let err = tokenize_line("LOAD_INT 0xZZ", 3).unwrap_err();
        assert_eq!(
            err,
            AsmError::InvalidNumber {
                line: 3,
                token: "0xZZ".to_string()
            }
        );
    }
}
