use std::fmt;
use std::iter::FusedIterator;

use crate::error::{CompileError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Number(i32),
    Operator(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Operator(c) => write!(f, "{}", c),
        }
    }
}

fn magnitude(digits: &str, radix: u32) -> u64 {
    digits
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0u64, |acc, d| {
            acc.saturating_mul(u64::from(radix))
                .saturating_add(u64::from(d))
        })
}

/// Out-of-range literals saturate, the way a 32-bit `strtol` does.
fn signed(negative: bool, magnitude: u64) -> i32 {
    let value = i64::try_from(magnitude).unwrap_or(i64::MAX);
    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn first_char(s: &str) -> char {
    s.chars().next().unwrap_or_default()
}

peg::parser! {
    grammar lexer() for str {
        rule space() = quiet!{[' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r']}

        rule hex() -> u64
            = ['0'] ['x' | 'X'] d:$(['0'..='9' | 'a'..='f' | 'A'..='F']+) { magnitude(d, 16) }

        rule octal() -> u64
            = ['0'] d:$(['0'..='7']*) { magnitude(d, 8) }

        rule decimal() -> u64
            = d:$(['1'..='9'] ['0'..='9']*) { magnitude(d, 10) }

        rule number() -> i32
            = s:$(['+' | '-']?) m:(hex() / octal() / decimal()) { signed(s == "-", m) }

        // Anything else is a one-character operator, as long as it stands alone.
        rule operator() -> char
            = c:$([_]) &(space() / ![_]) { first_char(c) }

        rule token() -> Token
            = n:number() { Token::Number(n) }
            / c:operator() { Token::Operator(c) }

        rule spaced_token() -> Token
            = space()* t:token() { t }

        // Every token on the line, plus the offset where scanning stopped.
        // Anything left from that offset on is malformed.
        pub rule line() -> (Vec<Token>, usize)
            = ts:spaced_token()* space()* end:position!() [_]* { (ts, end) }
    }
}

/// Splits one input line into tokens.
///
/// The line is scanned once up front; tokens are then handed out one at a
/// time. Yields at most one error, after the tokens that precede it, and is
/// exhausted afterwards.
pub struct Tokens {
    tokens: std::vec::IntoIter<Token>,
    error: Option<CompileError>,
}

impl Tokens {
    pub fn new(line: &str) -> Self {
        let (tokens, end) = match lexer::line(line) {
            Ok(scanned) => scanned,
            Err(err) => (Vec::new(), err.location.offset),
        };
        let error = (end < line.len()).then_some(CompileError::InvalidToken { offset: end });
        Self {
            tokens: tokens.into_iter(),
            error,
        }
    }
}

impl Iterator for Tokens {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.tokens.next() {
            Some(token) => Some(Ok(token)),
            None => self.error.take().map(Err),
        }
    }
}

impl FusedIterator for Tokens {}

pub fn tokenize(line: &str) -> Tokens {
    Tokens::new(line)
}
