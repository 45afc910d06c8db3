//! Running compiled expressions.

use std::fmt;
use std::mem;

use cranelift_jit::JITModule;
use tracing::debug;

use crate::compiler;
use crate::config::Config;
use crate::error::Result;
use crate::token::tokenize;

/// A finished routine together with the memory it runs on.
///
/// The generated code embeds the address of `stack`, so the two live and die
/// together. Dropping the program releases its executable memory.
pub struct CompiledProgram {
    module: Option<JITModule>,
    entry: *const u8,
    stack: Box<[i32]>,
}

impl CompiledProgram {
    pub(crate) fn new(module: JITModule, entry: *const u8, stack: Box<[i32]>) -> Self {
        Self {
            module: Some(module),
            entry,
            stack,
        }
    }

    /// Number of 32-bit words backing the value stack.
    pub fn stack_words(&self) -> usize {
        self.stack.len()
    }

    /// Call the routine. A program runs exactly once.
    pub fn run(self) -> i32 {
        // SAFETY: `entry` was produced by `JITModule::get_finalized_function`
        // for a function with signature `fn() -> i32` in the platform calling
        // convention, and `module` keeps its memory mapped. Every load and
        // store it performs lands inside `stack`, which is sized by the
        // compiler to the deepest slot used.
        let routine = unsafe { mem::transmute::<*const u8, extern "C" fn() -> i32>(self.entry) };
        let value = routine();
        debug!(value, "executed");
        value
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("entry", &self.entry)
            .field("stack_words", &self.stack.len())
            .finish()
    }
}

impl Drop for CompiledProgram {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `entry` is never called again once the program is
            // being dropped.
            unsafe { module.free_memory() };
        }
    }
}

/// Tokenize, compile and run one line.
pub fn evaluate(line: &str, config: Config) -> Result<i32> {
    let program = compiler::compile(tokenize(line), config)?;
    Ok(program.run())
}
