//! Parser error.

use thiserror::Error;

/// Syntax or static validation failure, with the byte offset of the
/// offending token and the set of tokens that were acceptable there.
#[derive(Debug, Error, PartialEq)]
#[error("at offset {offset}: expected {}, found {found}", expected.join(" | "))]
pub struct ParseError {
    pub offset: usize,
    pub expected: Vec<&'static str>,
    pub found: String,
}

impl ParseError {
    pub fn new(offset: usize, expected: Vec<&'static str>, found: impl Into<String>) -> Self {
        Self {
            offset,
            expected,
            found: found.into(),
        }
    }
}
