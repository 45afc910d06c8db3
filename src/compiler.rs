//! Stack-machine compiler.
//!
//! Tokens are turned into [`Op`]s one at a time. Each op has a fixed encoded
//! size that is charged against [`CODE_CAP`], and pushes walk `stack_top`
//! down from [`STACK_CAP`] the way the generated code will walk the value
//! stack. Nothing runs until [`CompilationContext::finalize`] hands the
//! finished buffer to the JIT.

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{CompileError, Region, Result};
use crate::executor::CompiledProgram;
use crate::jit::Jit;
use crate::token::Token;

/// Capacity of the instruction buffer, in bytes.
pub const CODE_CAP: usize = 4000;

/// Capacity of the value stack, in 32-bit words.
pub const STACK_CAP: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Neg,
    Not,
}

/// One entry in the instruction buffer.
///
/// Slots are logical value-stack indices. In unguarded mode they may go
/// negative once the stack has been overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Point at the value stack and clear the top-of-stack register.
    Prologue,
    /// Spill the top-of-stack register into `slot`, then load `value`.
    Push { slot: isize, value: i32 },
    /// Combine the value in `slot` with the top-of-stack register.
    Binary { op: BinaryOp, slot: isize },
    Unary(UnaryOp),
    Nop,
    /// Return the top-of-stack register.
    Epilogue,
}

impl Op {
    /// Bytes this op occupies in the instruction buffer.
    pub fn encoded_len(&self) -> usize {
        match self {
            Op::Prologue => 14,
            Op::Push { .. } => 13,
            Op::Binary { op, .. } => match op {
                BinaryOp::Add | BinaryOp::Sub => 9,
                BinaryOp::Mul => 10,
                BinaryOp::Div => 22,
                BinaryOp::Pow => 29,
            },
            Op::Unary(UnaryOp::Abs) => 14,
            Op::Unary(UnaryOp::Neg | UnaryOp::Not) => 2,
            Op::Nop => 1,
            Op::Epilogue => 5,
        }
    }
}

enum Operator {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Unknown,
}

impl From<char> for Operator {
    fn from(c: char) -> Self {
        match c {
            '+' => Operator::Binary(BinaryOp::Add),
            '-' => Operator::Binary(BinaryOp::Sub),
            '*' => Operator::Binary(BinaryOp::Mul),
            '/' => Operator::Binary(BinaryOp::Div),
            '^' => Operator::Binary(BinaryOp::Pow),
            '|' => Operator::Unary(UnaryOp::Abs),
            '~' => Operator::Unary(UnaryOp::Neg),
            '!' => Operator::Unary(UnaryOp::Not),
            _ => Operator::Unknown,
        }
    }
}

/// Compilation state for a single expression.
pub struct CompilationContext {
    config: Config,
    code: Vec<Op>,
    code_pos: usize,
    stack_top: isize,
    /// Lowest value `stack_top` has reached.
    stack_floor: isize,
    operand_count: usize,
    failed: Option<CompileError>,
}

impl CompilationContext {
    pub fn new(config: Config) -> Self {
        let mut ctx = Self {
            config,
            code: Vec::new(),
            code_pos: 0,
            stack_top: STACK_CAP as isize,
            stack_floor: STACK_CAP as isize,
            operand_count: 0,
            failed: None,
        };
        // The prologue always fits an empty buffer.
        ctx.write(Op::Prologue);
        ctx
    }

    pub fn code(&self) -> &[Op] {
        &self.code
    }

    pub fn code_pos(&self) -> usize {
        self.code_pos
    }

    pub fn stack_top(&self) -> isize {
        self.stack_top
    }

    pub fn operand_count(&self) -> usize {
        self.operand_count
    }

    /// Compile one token.
    ///
    /// Errors are sticky: once a token fails, every later call returns the
    /// same error without emitting anything. An unguarded write that runs
    /// off the end of the instruction buffer is let through, but latches
    /// `Overflow(Code)` for everything after it.
    pub fn compile(&mut self, token: Token) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let result = match token {
            Token::Number(n) => self.push(n),
            Token::Operator(c) => self.operator(c),
        };
        if let Err(err) = &result {
            debug!(%token, %err, "compilation failed");
            self.failed = Some(err.clone());
        } else if self.code_pos >= CODE_CAP {
            warn!(code_pos = self.code_pos, "instruction buffer overran its capacity");
            self.failed = Some(CompileError::Overflow(Region::Code));
        }
        result
    }

    fn push(&mut self, value: i32) -> Result<()> {
        let op = Op::Push {
            slot: self.stack_top - 1,
            value,
        };
        self.reserve(&op)?;
        if self.config.hardened && self.stack_top <= 0 {
            return Err(CompileError::Overflow(Region::Stack));
        }
        self.write(op);
        self.stack_top -= 1;
        self.stack_floor = self.stack_floor.min(self.stack_top);
        self.operand_count += 1;
        Ok(())
    }

    fn operator(&mut self, c: char) -> Result<()> {
        match Operator::from(c) {
            Operator::Binary(op) => {
                let emitted = Op::Binary {
                    op,
                    slot: self.stack_top,
                };
                self.reserve(&emitted)?;
                self.require(c, 2)?;
                self.write(emitted);
                self.stack_top += 1;
                self.operand_count -= 1;
            }
            Operator::Unary(op) => {
                let emitted = Op::Unary(op);
                self.reserve(&emitted)?;
                self.require(c, 1)?;
                self.write(emitted);
            }
            Operator::Unknown => {
                self.reserve(&Op::Nop)?;
                self.write(Op::Nop);
            }
        }
        Ok(())
    }

    fn require(&self, op: char, needed: usize) -> Result<()> {
        if self.operand_count < needed {
            return Err(CompileError::Underflow {
                op,
                needed,
                available: self.operand_count,
            });
        }
        Ok(())
    }

    /// Hardened mode only: make sure `op` fits in the instruction buffer.
    fn reserve(&self, op: &Op) -> Result<()> {
        if self.config.hardened {
            self.fits(op)?;
        }
        Ok(())
    }

    fn fits(&self, op: &Op) -> Result<()> {
        if self.code_pos + op.encoded_len() >= CODE_CAP {
            return Err(CompileError::Overflow(Region::Code));
        }
        Ok(())
    }

    fn write(&mut self, op: Op) {
        trace!(?op, code_pos = self.code_pos, "emit");
        self.code_pos += op.encoded_len();
        self.code.push(op);
    }

    /// Append the epilogue and JIT the buffer.
    ///
    /// The epilogue is checked against the buffer capacity in both modes.
    pub fn finalize(mut self) -> Result<CompiledProgram> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        self.fits(&Op::Epilogue)?;
        self.write(Op::Epilogue);

        let spill = usize::try_from(-self.stack_floor).unwrap_or(0);
        if spill > 0 {
            warn!(spill, "value stack overran its capacity");
        }
        debug!(
            ops = self.code.len(),
            code_pos = self.code_pos,
            depth = self.operand_count,
            "finalized"
        );
        Jit::new()?.compile(&self.code, spill)
    }
}

/// Compile every token of `tokens` into a fresh context and finalize it.
pub fn compile<I>(tokens: I, config: Config) -> Result<CompiledProgram>
where
    I: IntoIterator<Item = Result<Token>>,
{
    let mut ctx = CompilationContext::new(config);
    for token in tokens {
        ctx.compile(token?)?;
    }
    ctx.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ctx: &mut CompilationContext, tokens: &[Token]) -> Result<()> {
        tokens.iter().try_for_each(|t| ctx.compile(*t))
    }

    #[test]
    fn tracks_operands_and_stack() {
        let mut ctx = CompilationContext::new(Config::hardened());
        feed(
            &mut ctx,
            &[Token::Number(2), Token::Number(3), Token::Operator('+')],
        )
        .unwrap();
        assert_eq!(ctx.operand_count(), 1);
        assert_eq!(ctx.stack_top(), STACK_CAP as isize - 1);
        assert_eq!(ctx.code_pos(), 14 + 13 + 13 + 9);
        assert_eq!(
            ctx.code(),
            &[
                Op::Prologue,
                Op::Push { slot: 249, value: 2 },
                Op::Push { slot: 248, value: 3 },
                Op::Binary {
                    op: BinaryOp::Add,
                    slot: 248
                },
            ]
        );
    }

    #[test]
    fn unary_keeps_depth() {
        let mut ctx = CompilationContext::new(Config::unguarded());
        feed(
            &mut ctx,
            &[
                Token::Number(5),
                Token::Operator('|'),
                Token::Operator('~'),
                Token::Operator('!'),
            ],
        )
        .unwrap();
        assert_eq!(ctx.operand_count(), 1);
        assert_eq!(ctx.stack_top(), STACK_CAP as isize - 1);
        assert_eq!(ctx.code_pos(), 14 + 13 + 14 + 2 + 2);
    }

    #[test]
    fn binary_underflow() {
        let mut ctx = CompilationContext::new(Config::unguarded());
        assert_eq!(
            ctx.compile(Token::Operator('+')),
            Err(CompileError::Underflow {
                op: '+',
                needed: 2,
                available: 0
            })
        );
        assert_eq!(ctx.code(), &[Op::Prologue]);
    }

    #[test]
    fn unary_underflow() {
        let mut ctx = CompilationContext::new(Config::unguarded());
        assert!(matches!(
            ctx.compile(Token::Operator('~')),
            Err(CompileError::Underflow { needed: 1, .. })
        ));
    }

    #[test]
    fn errors_are_sticky() {
        let mut ctx = CompilationContext::new(Config::unguarded());
        let err = ctx.compile(Token::Operator('*')).unwrap_err();
        assert_eq!(ctx.compile(Token::Number(1)), Err(err.clone()));
        assert_eq!(ctx.code(), &[Op::Prologue]);
        assert_eq!(ctx.finalize().err(), Some(err));
    }

    #[test]
    fn unknown_operator_is_nop() {
        let mut ctx = CompilationContext::new(Config::hardened());
        feed(&mut ctx, &[Token::Operator('@')]).unwrap();
        assert_eq!(ctx.code(), &[Op::Prologue, Op::Nop]);
        assert_eq!(ctx.operand_count(), 0);
    }

    #[test]
    fn hardened_stack_overflow() {
        let mut ctx = CompilationContext::new(Config::hardened());
        for i in 0..STACK_CAP {
            ctx.compile(Token::Number(i as i32)).unwrap();
        }
        let pos = ctx.code_pos();
        let len = ctx.code().len();
        assert_eq!(
            ctx.compile(Token::Number(0)),
            Err(CompileError::Overflow(Region::Stack))
        );
        assert_eq!(ctx.code_pos(), pos);
        assert_eq!(ctx.code().len(), len);
        assert_eq!(ctx.stack_top(), 0);
    }

    #[test]
    fn unguarded_stack_overrun_goes_unnoticed() {
        let mut ctx = CompilationContext::new(Config::unguarded());
        for i in 0..STACK_CAP + 10 {
            ctx.compile(Token::Number(i as i32)).unwrap();
        }
        assert_eq!(ctx.stack_top(), -10);
        assert_eq!(ctx.operand_count(), STACK_CAP + 10);
    }

    #[test]
    fn hardened_code_overflow() {
        let mut ctx = CompilationContext::new(Config::hardened());
        ctx.compile(Token::Number(1)).unwrap();
        let err = loop {
            if let Err(err) = ctx.compile(Token::Operator('~')) {
                break err;
            }
        };
        assert_eq!(err, CompileError::Overflow(Region::Code));
        assert!(ctx.code_pos() < CODE_CAP);
        assert!(ctx.code_pos() + 2 >= CODE_CAP);
    }

    #[test]
    fn unguarded_code_overrun_stops_emission() {
        let mut ctx = CompilationContext::new(Config::unguarded());
        ctx.compile(Token::Number(1)).unwrap();
        // 14 + 13 + 2 * 1986 = 3999: still inside the buffer.
        for _ in 0..1986 {
            ctx.compile(Token::Operator('~')).unwrap();
        }
        assert_eq!(ctx.code_pos(), 3999);
        // This write runs past the end and is let through.
        ctx.compile(Token::Operator('~')).unwrap();
        assert_eq!(ctx.code_pos(), 4001);
        let len = ctx.code().len();
        for _ in 0..10_000 {
            assert_eq!(
                ctx.compile(Token::Operator('~')),
                Err(CompileError::Overflow(Region::Code))
            );
        }
        assert_eq!(ctx.code().len(), len);
        assert_eq!(ctx.code_pos(), 4001);
        assert_eq!(
            ctx.finalize().err(),
            Some(CompileError::Overflow(Region::Code))
        );
    }

    #[test]
    fn code_overflow_checked_before_underflow() {
        // 14 + 13 + 2 * 1983 = 3993: a 9-byte `+` no longer fits.
        let mut ctx = CompilationContext::new(Config::hardened());
        ctx.compile(Token::Number(1)).unwrap();
        for _ in 0..1983 {
            ctx.compile(Token::Operator('~')).unwrap();
        }
        assert_eq!(ctx.code_pos(), 3993);
        assert_eq!(
            ctx.compile(Token::Operator('+')),
            Err(CompileError::Overflow(Region::Code))
        );
        assert_eq!(ctx.code_pos(), 3993);

        // Without the capacity check the same `+` is an underflow.
        let mut ctx = CompilationContext::new(Config::unguarded());
        ctx.compile(Token::Number(1)).unwrap();
        for _ in 0..1983 {
            ctx.compile(Token::Operator('~')).unwrap();
        }
        assert_eq!(
            ctx.compile(Token::Operator('+')),
            Err(CompileError::Underflow {
                op: '+',
                needed: 2,
                available: 1
            })
        );
    }

    #[test]
    fn epilogue_must_fit() {
        // 14 + 13 + 2 * 1984 = 3995; the 5-byte epilogue would end exactly at
        // the capacity, which is rejected.
        let mut ctx = CompilationContext::new(Config::unguarded());
        ctx.compile(Token::Number(1)).unwrap();
        for _ in 0..1984 {
            ctx.compile(Token::Operator('~')).unwrap();
        }
        assert_eq!(ctx.code_pos(), 3995);
        assert_eq!(
            ctx.finalize().err(),
            Some(CompileError::Overflow(Region::Code))
        );
    }
}
