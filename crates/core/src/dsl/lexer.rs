use std::fmt;

use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Eq,
    Edge,
    Dot,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Str(_) => f.write_str("string literal"),
            TokenKind::Number(n) => write!(f, "number `{n}`"),
            TokenKind::LBrace => f.write_str("`{`"),
            TokenKind::RBrace => f.write_str("`}`"),
            TokenKind::LBracket => f.write_str("`[`"),
            TokenKind::RBracket => f.write_str("`]`"),
            TokenKind::Comma => f.write_str("`,`"),
            TokenKind::Colon => f.write_str("`:`"),
            TokenKind::Eq => f.write_str("`=`"),
            TokenKind::Edge => f.write_str("`>>`"),
            TokenKind::Dot => f.write_str("`.`"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_line(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn string(&mut self, line: usize, column: usize) -> Result<String, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(SyntaxError::new("unterminated string literal", line, column));
                }
                Some('"') => return Ok(out),
                Some('\\') => {
                    let (esc_line, esc_col) = (self.line, self.column);
                    match self.bump() {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('r') => out.push('\r'),
                        Some('"') => out.push('"'),
                        Some('\\') => out.push('\\'),
                        Some(other) => {
                            return Err(SyntaxError::new(
                                format!("unknown escape sequence `\\{other}`"),
                                esc_line,
                                esc_col,
                            ))
                        }
                        None => {
                            return Err(SyntaxError::new(
                                "unterminated string literal",
                                line,
                                column,
                            ))
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self, first: char, line: usize, column: usize) -> Result<f64, SyntaxError> {
        let mut text = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text.replace('_', "")
            .parse::<f64>()
            .map_err(|_| SyntaxError::new(format!("invalid number `{text}`"), line, column))
    }

    fn ident(&mut self, first: char) -> String {
        let mut text = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        loop {
            match self.chars.peek().copied() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    if self.chars.peek() == Some(&'/') {
                        self.skip_line();
                    } else {
                        return Err(SyntaxError::new("unexpected `/`", line, column));
                    }
                }
                _ => break,
            }
        }

        let (line, column) = (self.line, self.column);
        let token = |kind| Token { kind, line, column };
        let Some(c) = self.bump() else {
            return Ok(token(TokenKind::Eof));
        };
        let kind = match c {
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '=' => TokenKind::Eq,
            '.' => TokenKind::Dot,
            '>' => {
                if self.chars.peek() == Some(&'>') {
                    self.bump();
                    TokenKind::Edge
                } else {
                    return Err(SyntaxError::new(
                        "malformed edge operator, expected `>>`",
                        line,
                        column,
                    ));
                }
            }
            '"' => TokenKind::Str(self.string(line, column)?),
            c if c.is_ascii_digit() => TokenKind::Number(self.number(c, line, column)?),
            '-' if self.chars.peek().is_some_and(|c| c.is_ascii_digit()) => {
                TokenKind::Number(-self.number('0', line, column)?)
            }
            c if c.is_alphabetic() || c == '_' => TokenKind::Ident(self.ident(c)),
            other => {
                return Err(SyntaxError::new(
                    format!("unexpected character `{other}`"),
                    line,
                    column,
                ))
            }
        };
        Ok(token(kind))
    }
}

/// Split source text into tokens. The last token is always `Eof`.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}
