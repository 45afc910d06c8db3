use thiserror::Error;

/// Which fixed-capacity buffer ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Code,
    Stack,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Code => f.write_str("instruction buffer"),
            Region::Stack => f.write_str("value stack"),
        }
    }
}

/// Everything that can stop a line from being executed.
///
/// The REPL reports all of these the same way; the detail only shows up in
/// the logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// An operator character was not followed by whitespace or end of line.
    #[error("invalid token at offset {offset}")]
    InvalidToken { offset: usize },

    #[error("`{op}` needs {needed} operand(s), only {available} available")]
    Underflow {
        op: char,
        needed: usize,
        available: usize,
    },

    #[error("{0} exhausted")]
    Overflow(Region),

    /// Cranelift refused the generated function.
    #[error("code generation failed: {0}")]
    Codegen(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;
