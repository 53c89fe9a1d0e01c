//! Error types for record I/O.
//!
//! Only I/O and parsing are fallible. Broken graph invariants are
//! programming errors and panic at the point of detection.

use std::path::PathBuf;
use thiserror::Error;

use crate::Position;

#[derive(Error, Debug)]
pub enum ArgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A required input file does not exist.
    #[error("input file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A breakpoint read from the branch records has no matching
    /// recombination record.
    #[error("no recombination record for breakpoint {pos}")]
    MissingRecombination { pos: Position },
}

pub type Result<T> = std::result::Result<T, ArgError>;

impl ArgError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
