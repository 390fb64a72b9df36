use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Int(n) => write!(f, "{n}"),
            Token::Float(n) => write!(f, "{n}"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::Comma => f.write_str(","),
            Token::Colon => f.write_str(":"),
            Token::Dot => f.write_str("."),
            Token::Assign => f.write_str("="),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::EqEq => f.write_str("=="),
            Token::NotEq => f.write_str("!="),
            Token::Lt => f.write_str("<"),
            Token::Le => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Ge => f.write_str(">="),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    /// Byte offset of the token start in the source.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, LexError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let (text, next) = lex_string(&chars, i)?;
            tokens.push(Spanned { token: Token::Str(text), offset });
            i = next;
            continue;
        }

        if c.is_ascii_digit() {
            let (token, next) = lex_number(src, &chars, i)?;
            tokens.push(Spanned { token, offset });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push(Spanned { token: Token::Ident(ident), offset });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', _) => (Token::Assign, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            (':', _) => (Token::Colon, 1),
            ('.', _) => (Token::Dot, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            _ => {
                return Err(LexError {
                    offset,
                    message: format!("unexpected character {c:?}"),
                })
            }
        };
        tokens.push(Spanned { token, offset });
        i += width;
    }

    Ok(tokens)
}

/// Python-style quoted literal. Known escapes are decoded, unknown ones keep
/// their backslash.
fn lex_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), LexError> {
    let (offset, quote) = chars[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let Some(&(_, escaped)) = chars.get(i + 1) else {
                break;
            };
            match escaped {
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '\n' => {}
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }

    Err(LexError {
        offset,
        message: "unterminated string literal".into(),
    })
}

fn lex_number(
    src: &str,
    chars: &[(usize, char)],
    start: usize,
) -> Result<(Token, usize), LexError> {
    let mut i = start;
    let mut is_float = false;

    while i < chars.len() && chars[i].1.is_ascii_digit() {
        i += 1;
    }
    if i < chars.len() && chars[i].1 == '.' {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].1.is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i].1 == 'e' || chars[i].1 == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j].1 == '+' || chars[j].1 == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].1.is_ascii_digit() {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
        }
    }

    let begin = chars[start].0;
    let end = chars.get(i).map(|(o, _)| *o).unwrap_or(src.len());
    let text = &src[begin..end];

    let token = if is_float {
        text.parse::<f64>().map(Token::Float)
            .map_err(|e| LexError { offset: begin, message: format!("bad float {text}: {e}") })?
    } else {
        text.parse::<i64>().map(Token::Int)
            .map_err(|e| LexError { offset: begin, message: format!("bad integer {text}: {e}") })?
    };
    Ok((token, i))
}

/// Read cursor over a token stream.
pub struct Cursor {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Cursor {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    pub fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|s| &s.token)
    }

    pub fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume `expected` if it is the next token.
    pub fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            Some(t) => Err(format!("expected '{expected}', found '{t}'")),
            None => Err(format!("expected '{expected}', found end of input")),
        }
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn call_with_keyword_string() {
        assert_eq!(
            kinds("click(start_box='(1,2)')"),
            vec![
                Token::Ident("click".into()),
                Token::LParen,
                Token::Ident("start_box".into()),
                Token::Assign,
                Token::Str("(1,2)".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn string_escapes_are_decoded() {
        assert_eq!(kinds(r"'it\'s\n'"), vec![Token::Str("it's\n".into())]);
        assert_eq!(kinds(r#""a\d""#), vec![Token::Str("a\\d".into())]);
    }

    #[test]
    fn numbers_and_operators() {
        assert_eq!(
            kinds("1e-3 <= 2.5 != 7"),
            vec![Token::Float(0.001), Token::Le, Token::Float(2.5), Token::NotEq, Token::Int(7)]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("type(content='abc").unwrap_err();
        assert_eq!(err.offset, 13);
    }

    #[test]
    fn stray_character_is_an_error() {
        assert!(tokenize("click(start_box=$)").is_err());
    }
}
