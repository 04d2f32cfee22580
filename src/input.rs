//! Reading transform parameters from a text stream.
//!
//! Values are separated by whitespace or commas and may span lines, so
//! `1 2 3`, `1, 2, 3` and one value per line all read the same.

use std::collections::VecDeque;
use std::io::BufRead;

use crate::error::BenchError;

/// Parameter names, in prompt order.
pub const TRANSLATE_NAMES: [&str; 3] = ["tx", "ty", "tz"];
pub const SCALE_NAMES: [&str; 3] = ["sx", "sy", "sz"];

/// Pulls scalar tokens out of a line-oriented reader.
pub struct ScalarReader<R> {
    input: R,
    pending: VecDeque<String>,
}

impl<R: BufRead> ScalarReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            pending: VecDeque::new(),
        }
    }

    fn next_token(&mut self, name: &str) -> Result<String, BenchError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(token);
            }
            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .map_err(|e| BenchError::Input(format!("failed to read {name}: {e}")))?;
            if read == 0 {
                return Err(BenchError::Input(format!(
                    "expected a value for {name}, got end of input"
                )));
            }
            self.pending.extend(
                line.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned),
            );
        }
    }

    /// Reads three scalars named `names`.
    ///
    /// # Errors
    ///
    /// [`BenchError::Input`] on end of input, a read error or a token that is
    /// not a number.
    pub fn read_triple(&mut self, names: [&str; 3]) -> Result<[f32; 3], BenchError> {
        let mut out = [0.0; 3];
        for (slot, name) in out.iter_mut().zip(names) {
            let token = self.next_token(name)?;
            *slot = parse_scalar(&token, name)?;
        }
        Ok(out)
    }
}

/// Parses one scalar, naming it in the error.
///
/// # Errors
///
/// [`BenchError::Input`] if `token` is not a number.
pub fn parse_scalar(token: &str, name: &str) -> Result<f32, BenchError> {
    token
        .trim()
        .parse()
        .map_err(|_| BenchError::Input(format!("{name} is not a number: `{token}`")))
}
