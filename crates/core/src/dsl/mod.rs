//! The `.glue` configuration language.
//!
//! [`parse`] turns source text into a [`Document`]: an ordered list of
//! declarations where blocks nest, values may be strings, numbers, booleans,
//! identifiers, `os.<name>` secret references, lists, inline objects or
//! `a >> b` chains. Layout and comments (`//` and `#`) carry no meaning.

mod ast;
mod lexer;
mod parser;

pub use ast::{Block, Decl, Document, Value};

/// Malformed configuration text. Positions are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

/// Parse `.glue` source text.
pub fn parse(source: &str) -> Result<Document, SyntaxError> {
    parser::Parser::new(source)?.parse_document()
}
