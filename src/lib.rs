//! Integer RPN calculator backed by a per-line JIT.
//!
//! A line is split into [`token::Token`]s, compiled into a stack-machine
//! instruction buffer by [`compiler::CompilationContext`], lowered to native
//! code with Cranelift, and run once as `fn() -> i32`.

pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
mod jit;
pub mod repl;
pub mod token;

pub use config::Config;
pub use error::{CompileError, Region};
pub use executor::{evaluate, CompiledProgram};
