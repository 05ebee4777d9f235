use super::ast::{Block, Decl, Document, Value};
use super::lexer::{tokenize, Token, TokenKind};
use super::SyntaxError;
use crate::secret::SecretRef;

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(source: &str) -> Result<Self, SyntaxError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn kind_at(&self, offset: usize) -> &TokenKind {
        &self.peek_at(offset).kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(message, token.line, token.column)
    }

    fn unexpected(&self, context: &str) -> SyntaxError {
        self.error_here(format!("unexpected {} {context}", self.peek().kind))
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, SyntaxError> {
        if let TokenKind::Ident(name) = self.kind_at(0).clone() {
            self.advance();
            Ok(name)
        } else {
            Err(self.unexpected(context))
        }
    }

    fn skip_commas(&mut self) {
        while *self.kind_at(0) == TokenKind::Comma {
            self.advance();
        }
    }

    pub(crate) fn parse_document(&mut self) -> Result<Document, SyntaxError> {
        let mut document = Document::default();
        loop {
            self.skip_commas();
            match self.kind_at(0) {
                TokenKind::Eof => return Ok(document),
                TokenKind::RBrace => return Err(self.error_here("unmatched `}`")),
                _ if self.is_apply_directive() => {
                    self.advance();
                    self.advance();
                    self.skip_commas();
                    if *self.kind_at(0) != TokenKind::Eof {
                        return Err(self.error_here("`apply glue` must be the last item"));
                    }
                    document.applied = true;
                    return Ok(document);
                }
                _ => document.items.push(self.parse_decl()?),
            }
        }
    }

    fn is_apply_directive(&self) -> bool {
        matches!(self.kind_at(0), TokenKind::Ident(w) if w == "apply")
            && matches!(self.kind_at(1), TokenKind::Ident(w) if w == "glue")
            && *self.kind_at(2) != TokenKind::LBrace
    }

    /// Body of a block or object literal, up to and including the closing `}`.
    fn parse_body(&mut self, open: &Token) -> Result<Vec<Decl>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            self.skip_commas();
            match self.kind_at(0) {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(body);
                }
                TokenKind::Eof => {
                    return Err(SyntaxError::new(
                        format!(
                            "unclosed `{{` opened at line {}, column {}",
                            open.line, open.column
                        ),
                        open.line,
                        open.column,
                    ))
                }
                _ => body.push(self.parse_decl()?),
            }
        }
    }

    fn parse_decl(&mut self) -> Result<Decl, SyntaxError> {
        let name = self.expect_ident("at start of declaration")?;

        match self.kind_at(0).clone() {
            TokenKind::LBrace => {
                let open = self.advance();
                let body = self.parse_body(&open)?;
                Ok(Decl::Block(Block::new(name, body)))
            }
            TokenKind::Ident(second) if *self.kind_at(1) == TokenKind::LBrace => {
                self.advance();
                let open = self.advance();
                let body = self.parse_body(&open)?;
                Ok(Decl::Block(Block {
                    keyword: Some(name),
                    name: second,
                    body,
                }))
            }
            TokenKind::Eq => {
                self.advance();
                let value = self.parse_value()?;
                Ok(Decl::Assign { key: name, value })
            }
            TokenKind::Colon => {
                self.advance();
                let value = self.parse_value()?;
                Ok(Decl::Entry { key: name, value })
            }
            TokenKind::Dot if name == "os" => Ok(Decl::Secret(self.parse_secret_tail()?)),
            TokenKind::Edge => Ok(Decl::Chain(self.parse_chain_tail(name)?)),
            TokenKind::Dot => Err(self.error_here(format!(
                "unexpected `.` after `{name}`, only `os.<name>` references are allowed"
            ))),
            _ => Ok(Decl::Word(name)),
        }
    }

    fn parse_secret_tail(&mut self) -> Result<SecretRef, SyntaxError> {
        self.advance();
        let name = self.expect_ident("after `os.`")?;
        Ok(SecretRef::new(name))
    }

    /// `>> b >> c` following an already consumed `a`.
    fn parse_chain_tail(&mut self, first: String) -> Result<Vec<String>, SyntaxError> {
        let mut names = vec![first];
        while *self.kind_at(0) == TokenKind::Edge {
            let edge = self.advance();
            match self.kind_at(0) {
                TokenKind::Ident(_) => names.push(self.expect_ident("after `>>`")?),
                _ => {
                    return Err(SyntaxError::new(
                        "malformed edge operator, `>>` must be followed by a name",
                        edge.line,
                        edge.column,
                    ))
                }
            }
        }
        Ok(names)
    }

    fn parse_value(&mut self) -> Result<Value, SyntaxError> {
        let first = self.parse_primary()?;
        if !is_scalar(&first) {
            return Ok(first);
        }
        // A bare list continues while the item after a comma is not itself the
        // start of a new declaration.
        let mut items = vec![first];
        while *self.kind_at(0) == TokenKind::Comma && self.bare_list_continues() {
            self.advance();
            items.push(self.parse_primary()?);
        }
        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Ok(Value::List(items))
        }
    }

    fn bare_list_continues(&self) -> bool {
        let starts_scalar = matches!(
            self.kind_at(1),
            TokenKind::Ident(_) | TokenKind::Str(_) | TokenKind::Number(_)
        );
        let followed_by_decl = matches!(
            self.kind_at(2),
            TokenKind::Eq | TokenKind::Colon | TokenKind::LBrace | TokenKind::Edge
        ) || matches!(
            (self.kind_at(1), self.kind_at(2), self.kind_at(3)),
            (TokenKind::Ident(_), TokenKind::Ident(_), TokenKind::LBrace)
        );
        let is_secret = matches!(self.kind_at(1), TokenKind::Ident(w) if w == "os")
            && *self.kind_at(2) == TokenKind::Dot;
        starts_scalar && !followed_by_decl && !is_secret
    }

    fn parse_primary(&mut self) -> Result<Value, SyntaxError> {
        match self.kind_at(0).clone() {
            TokenKind::Str(s) => {
                self.advance();
                Ok(Value::Str(s))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Value::Number(n))
            }
            TokenKind::Ident(word) => {
                self.advance();
                let next = self.kind_at(0).clone();
                match (word.as_str(), next) {
                    ("os", TokenKind::Dot) => Ok(Value::Secret(self.parse_secret_tail()?)),
                    (_, TokenKind::Edge) => Ok(Value::Chain(self.parse_chain_tail(word.clone())?)),
                    ("true", _) => Ok(Value::Bool(true)),
                    ("false", _) => Ok(Value::Bool(false)),
                    _ => Ok(Value::Ident(word)),
                }
            }
            TokenKind::LBracket => {
                let open = self.advance();
                let mut items = Vec::new();
                loop {
                    self.skip_commas();
                    match self.kind_at(0) {
                        TokenKind::RBracket => {
                            self.advance();
                            return Ok(Value::List(items));
                        }
                        TokenKind::Eof | TokenKind::RBrace => {
                            return Err(SyntaxError::new(
                                format!(
                                    "unclosed `[` opened at line {}, column {}",
                                    open.line, open.column
                                ),
                                open.line,
                                open.column,
                            ))
                        }
                        _ => items.push(self.parse_primary()?),
                    }
                }
            }
            TokenKind::LBrace => {
                let open = self.advance();
                Ok(Value::Object(self.parse_body(&open)?))
            }
            TokenKind::Edge => Err(self.error_here(
                "malformed edge operator, `>>` must follow a name",
            )),
            _ => Err(self.unexpected("where a value was expected")),
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Str(_) | Value::Number(_) | Value::Bool(_) | Value::Ident(_)
    )
}
