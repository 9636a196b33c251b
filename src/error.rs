//! Provides [InterpretationError], the error that most things return.
use thiserror::Error;

/// Any error that can occur while interpreting Oba source code.
#[derive(Debug, Error)]
pub enum InterpretationError {
    /// A compile-time error, such as a syntax error, or a name error.
    #[error("compile-time error")]
    CompileError,
    /// A runtime error, such as a type error or an exhausted match.
    #[error("runtime error")]
    RuntimeError,
}

impl InterpretationError {
    /// The conventional process exit status for this error: 65 for errors
    /// detected at compile time, 70 for errors raised during execution.
    pub fn exit_code(&self) -> u8 {
        match self {
            InterpretationError::CompileError => 65,
            InterpretationError::RuntimeError => 70,
        }
    }
}
