//! A bytecode interpreter for the Oba scripting language.
//!
//! Oba is a small, expression-oriented language: newline-separated statements, first-class
//! functions with closures, `match` expressions, and a `debug` statement as its only output.
//! Source code goes through a single-pass [compiler] that emits a [chunk] of bytecode, which
//! the [vm] then executes on a value stack with call frames and upvalue capture.
//!
//! The embedding surface is deliberately tiny:
//!
//! ```
//! let mut vm = oba::vm::VM::new();
//! vm.interpret("debug 1 + 2").expect("prints DEBUG: 3");
//! ```

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod error;
pub mod heap;
pub mod object;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

mod with_try_from_u8;

/// The type returned by various functions that parse, compile, and run Oba code.
/// This is the standard [std::result::Result], but the error is always
/// [error::InterpretationError]. This type alias is generic for the return type, however.
///
/// ```
/// fn compile() -> oba::Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, error::InterpretationError>;

/// Re-exports common items.
///
/// The compiler and the VM share a lot of vocabulary (chunks, opcodes, values, tokens), so the
/// most common "global" items are collected here:
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::error::InterpretationError;
    pub use crate::scanner::{Lexeme, Scanner, Token};
    pub use crate::value::Value;
    pub use crate::vm::VM;
}
