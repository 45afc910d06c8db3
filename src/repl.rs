use std::io::{self, BufRead, Write};

use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::executor::evaluate;

const PROMPT: &str = "> ";
const QUIT: &str = "quit";

/// Render one evaluation the way the calculator prints it.
pub fn render(result: &Result<i32>) -> String {
    match result {
        Ok(value) => format!("{} ({:#010x})", value, value),
        Err(_) => "Error!".to_string(),
    }
}

/// Line-oriented front end: prompt, read, evaluate, print.
pub struct Repl<R, W> {
    input: R,
    output: W,
    config: Config,
}

impl<R: BufRead, W: Write> Repl<R, W> {
    pub fn new(input: R, output: W, config: Config) -> Self {
        Self {
            input,
            output,
            config,
        }
    }

    /// Run until `quit` or end of input.
    pub fn run(&mut self) -> io::Result<()> {
        let mut buf = Vec::new();
        loop {
            self.output.write_all(PROMPT.as_bytes())?;
            self.output.flush()?;

            buf.clear();
            if self.input.read_until(b'\n', &mut buf)? == 0 {
                info!("end of input");
                return Ok(());
            }
            let raw = String::from_utf8_lossy(&buf);
            let line = raw.strip_suffix('\n').unwrap_or(&raw);
            let line = line.strip_suffix('\r').unwrap_or(line);

            if line == QUIT {
                writeln!(self.output, "QUIT")?;
                return Ok(());
            }

            let result = evaluate(line, self.config);
            if let Err(err) = &result {
                debug!(line, %err, "line rejected");
            }
            writeln!(self.output, "{}", render(&result))?;
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }
}
