//! A sam-style structural edit engine: compile an address/command script,
//! run it against an editable buffer, and collect the resulting change
//! delta.
//!
//! Supported addresses: `#n` (rune offset), `n` (line), `/re/` and `?re?`
//! searches, `$`, `.`, `+`/`-` offsets, and `a1,a2` ranges. Supported
//! commands: `s/re/repl/[g]`, `d`, `a`, `i`, `c`, `p`, `=`, and bare
//! addresses (which only move dot).

mod address;
mod file;
mod program;

use thiserror::Error;

pub use file::File;
pub use program::{compile, Context, Program};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unknown command `{0}`")]
    UnknownCommand(char),
    #[error("command `{0}` is missing its delimiter")]
    MissingDelimiter(char),
    #[error("unterminated text, expected closing `{0}`")]
    UnterminatedText(char),
    #[error("malformed number in address")]
    BadNumber,
    #[error("empty command")]
    EmptyCommand,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no match for pattern `{0}`")]
    NoMatch(String),
    #[error("bad pattern: {0}")]
    BadPattern(String),
    #[error("printer write failed: {0}")]
    Print(#[from] std::io::Error),
}
