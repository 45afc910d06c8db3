use cranelift::prelude::types::I32;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use tracing::debug;

use crate::compiler::{BinaryOp, Op, UnaryOp, STACK_CAP};
use crate::error::{CompileError, Result};
use crate::executor::CompiledProgram;

fn codegen_error(err: impl std::fmt::Display) -> CompileError {
    CompileError::Codegen(err.to_string())
}

/// Lowers a finished instruction buffer to native code.
///
/// One `Jit` is built per expression and consumed by [`Jit::compile`]; the
/// module it owns moves into the resulting [`CompiledProgram`].
pub(crate) struct Jit {
    /// The function builder context.
    builder_context: FunctionBuilderContext,

    /// The main Cranelift context, which holds the state for codegen.
    ctx: codegen::Context,

    /// The module, with the jit backend, which owns the executable memory.
    module: JITModule,
}

impl Jit {
    pub(crate) fn new() -> Result<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(codegen_error)?;
        flag_builder.set("is_pic", "false").map_err(codegen_error)?;
        let isa_builder = cranelift_native::builder()
            .map_err(|msg| codegen_error(format!("host machine is not supported: {}", msg)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(codegen_error)?;
        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

        let module = JITModule::new(builder);
        Ok(Self {
            builder_context: FunctionBuilderContext::new(),
            ctx: module.make_context(),
            module,
        })
    }

    /// Build `fn() -> i32` from `code`.
    ///
    /// The value stack gets `spill` extra words below its logical base, so
    /// slot `s` lives at index `s + spill` of the backing buffer.
    pub(crate) fn compile(mut self, code: &[Op], spill: usize) -> Result<CompiledProgram> {
        let mut stack = vec![0i32; STACK_CAP + spill].into_boxed_slice();
        let stack_addr = stack.as_mut_ptr() as i64;
        let pointer_type = self.module.target_config().pointer_type();

        self.ctx.func.signature.returns.push(AbiParam::new(I32));

        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_context);
        let block = builder.create_block();
        builder.switch_to_block(block);
        builder.seal_block(block);

        let top = Variable::from_u32(0);
        builder.declare_var(top, I32);
        let base = Variable::from_u32(1);
        builder.declare_var(base, pointer_type);

        let offset = |slot: isize| -> i32 { ((slot + spill as isize) * 4) as i32 };

        for op in code {
            match *op {
                Op::Prologue => {
                    let addr = builder.ins().iconst(pointer_type, stack_addr);
                    builder.def_var(base, addr);
                    let zero = builder.ins().iconst(I32, 0);
                    builder.def_var(top, zero);
                }
                Op::Push { slot, value } => {
                    let (b, t) = (builder.use_var(base), builder.use_var(top));
                    builder.ins().store(MemFlags::trusted(), t, b, offset(slot));
                    let value = builder.ins().iconst(I32, i64::from(value as u32));
                    builder.def_var(top, value);
                }
                Op::Binary { op, slot } => {
                    let (b, rhs) = (builder.use_var(base), builder.use_var(top));
                    let lhs = builder.ins().load(I32, MemFlags::trusted(), b, offset(slot));
                    let result = binary(&mut builder, op, lhs, rhs);
                    builder.def_var(top, result);
                }
                Op::Unary(op) => {
                    let value = builder.use_var(top);
                    let result = unary(&mut builder, op, value);
                    builder.def_var(top, result);
                }
                Op::Nop => {}
                Op::Epilogue => {
                    let value = builder.use_var(top);
                    builder.ins().return_(&[value]);
                }
            }
        }

        builder.finalize();

        let function = self
            .module
            .declare_anonymous_function(&self.ctx.func.signature)
            .map_err(codegen_error)?;

        self.module
            .define_function(function, &mut self.ctx)
            .map_err(codegen_error)?;

        self.module.clear_context(&mut self.ctx);

        self.module.finalize_definitions().map_err(codegen_error)?;

        let entry = self.module.get_finalized_function(function);
        debug!(ops = code.len(), stack_words = stack.len(), "jit compiled");

        Ok(CompiledProgram::new(self.module, entry, stack))
    }
}

/// `lhs` is the deeper operand, `rhs` the top of the stack.
fn binary(builder: &mut FunctionBuilder, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
    match op {
        BinaryOp::Add => builder.ins().iadd(lhs, rhs),
        BinaryOp::Sub => builder.ins().isub(lhs, rhs),
        BinaryOp::Mul => builder.ins().imul(lhs, rhs),
        BinaryOp::Div => divide(builder, lhs, rhs),
        BinaryOp::Pow => power(builder, lhs, rhs),
    }
}

fn unary(builder: &mut FunctionBuilder, op: UnaryOp, value: Value) -> Value {
    match op {
        // abs(x) = x < 0 ? -x : x
        UnaryOp::Abs => {
            let zero = builder.ins().iconst(I32, 0);
            let is_neg = builder.ins().icmp(IntCC::SignedLessThan, value, zero);
            let negated = builder.ins().ineg(value);
            builder.ins().select(is_neg, negated, value)
        }
        UnaryOp::Neg => builder.ins().ineg(value),
        UnaryOp::Not => builder.ins().bnot(value),
    }
}

/// Truncating division that never traps: `x / 0 = 0`, `x / -1 = -x`.
fn divide(builder: &mut FunctionBuilder, lhs: Value, rhs: Value) -> Value {
    let zero = builder.ins().iconst(I32, 0);
    let one = builder.ins().iconst(I32, 1);
    let minus_one = builder.ins().iconst(I32, i64::from(u32::MAX));

    let by_zero = builder.ins().icmp(IntCC::Equal, rhs, zero);
    let by_minus_one = builder.ins().icmp(IntCC::Equal, rhs, minus_one);
    let special = builder.ins().bor(by_zero, by_minus_one);

    let divisor = builder.ins().select(special, one, rhs);
    let quotient = builder.ins().sdiv(lhs, divisor);
    let negated = builder.ins().ineg(lhs);
    let quotient = builder.ins().select(by_minus_one, negated, quotient);
    builder.ins().select(by_zero, zero, quotient)
}

/// `base ^ exp` with wrapping multiplication; negative exponents give 0.
///
/// Square-and-multiply over the 31 magnitude bits keeps the routine
/// straight-line while matching repeated multiplication modulo 2^32.
fn power(builder: &mut FunctionBuilder, base: Value, exp: Value) -> Value {
    let zero = builder.ins().iconst(I32, 0);
    let mut acc = builder.ins().iconst(I32, 1);
    let mut square = base;
    for bit in 0..31i64 {
        let shifted = builder.ins().ushr_imm(exp, bit);
        let set = builder.ins().band_imm(shifted, 1);
        let product = builder.ins().imul(acc, square);
        acc = builder.ins().select(set, product, acc);
        square = builder.ins().imul(square, square);
    }
    let negative = builder.ins().icmp(IntCC::SignedLessThan, exp, zero);
    builder.ins().select(negative, zero, acc)
}
