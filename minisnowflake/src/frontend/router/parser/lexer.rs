//! Tokenizer for the supported dialect.

use super::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare word: identifier or keyword.
    Word,
    /// Numeric literal, integer or float, optionally signed.
    Number,
    /// Single-quoted string, quotes stripped and '' unescaped.
    String,
    LeftParen,
    RightParen,
    Comma,
    Star,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub offset: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            offset,
        }
    }

    /// Case-insensitive keyword match for word tokens.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = vec![];
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos] as char;

        match c {
            ' ' | '\t' | '\r' | '\n' => pos += 1,

            '(' => {
                tokens.push(Token::new(TokenKind::LeftParen, "(", pos));
                pos += 1;
            }
            ')' => {
                tokens.push(Token::new(TokenKind::RightParen, ")", pos));
                pos += 1;
            }
            ',' => {
                tokens.push(Token::new(TokenKind::Comma, ",", pos));
                pos += 1;
            }
            '*' => {
                tokens.push(Token::new(TokenKind::Star, "*", pos));
                pos += 1;
            }
            ';' if pos + 1 == bytes.len() => pos += 1,

            '=' => {
                tokens.push(Token::new(TokenKind::Eq, "=", pos));
                pos += 1;
            }
            '!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::new(TokenKind::NotEq, "!=", pos));
                    pos += 2;
                } else {
                    return Err(ParseError::new(pos, vec!["!="], "!"));
                }
            }
            '<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::new(TokenKind::LtEq, "<=", pos));
                    pos += 2;
                } else {
                    tokens.push(Token::new(TokenKind::Lt, "<", pos));
                    pos += 1;
                }
            }
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::new(TokenKind::GtEq, ">=", pos));
                    pos += 2;
                } else {
                    tokens.push(Token::new(TokenKind::Gt, ">", pos));
                    pos += 1;
                }
            }

            '\'' => {
                let start = pos;
                let mut text = String::new();
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        None => {
                            return Err(ParseError::new(
                                start,
                                vec!["closing '"],
                                "end of input",
                            ))
                        }
                        Some(b'\'') => {
                            // '' escapes a quote inside the string.
                            if bytes.get(pos + 1) == Some(&b'\'') {
                                text.push('\'');
                                pos += 2;
                            } else {
                                pos += 1;
                                break;
                            }
                        }
                        Some(_) => {
                            let ch = input[pos..].chars().next().unwrap();
                            text.push(ch);
                            pos += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token::new(TokenKind::String, text, start));
            }

            '-' | '0'..='9' => {
                let start = pos;
                if c == '-' {
                    pos += 1;
                    if !matches!(bytes.get(pos), Some(b'0'..=b'9')) {
                        return Err(ParseError::new(start, vec!["number"], "-"));
                    }
                }
                while matches!(bytes.get(pos), Some(b'0'..=b'9')) {
                    pos += 1;
                }
                if bytes.get(pos) == Some(&b'.') {
                    pos += 1;
                    while matches!(bytes.get(pos), Some(b'0'..=b'9')) {
                        pos += 1;
                    }
                }
                tokens.push(Token::new(TokenKind::Number, &input[start..pos], start));
            }

            'a'..='z' | 'A'..='Z' | '_' => {
                let start = pos;
                while matches!(
                    bytes.get(pos),
                    Some(b'a'..=b'z') | Some(b'A'..=b'Z') | Some(b'0'..=b'9') | Some(b'_')
                ) {
                    pos += 1;
                }
                tokens.push(Token::new(TokenKind::Word, &input[start..pos], start));
            }

            _ => return Err(ParseError::new(pos, vec!["token"], c.to_string())),
        }
    }

    tokens.push(Token::new(TokenKind::Eof, "end of input", input.len()));
    Ok(tokens)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tokenize_operators() {
        let tokens = tokenize("a >= 10 AND b != 'it''s'").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::GtEq,
                TokenKind::Number,
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::NotEq,
                TokenKind::String,
                TokenKind::Eof,
            ]
        );
        assert_eq!(tokens[6].text, "it's");
    }

    #[test]
    fn test_tokenize_negative_number() {
        let tokens = tokenize("value > -1.5").unwrap();
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[2].text, "-1.5");
    }

    #[test]
    fn test_tokenize_offsets() {
        let tokens = tokenize("SELECT x").unwrap();
        assert_eq!(tokens[0].offset, 0);
        assert_eq!(tokens[1].offset, 7);
    }

    #[test]
    fn test_tokenize_unterminated_string() {
        let err = tokenize("WHERE a = 'oops").unwrap_err();
        assert_eq!(err.offset, 10);
    }
}
