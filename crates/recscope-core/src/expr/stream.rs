//! Input stream handle exposed to read procedures.
//!
//! The variable-length reader evaluates its `read_process` script once per
//! record with an [`InputStream`] bound to `input`. Scripts pull bytes with:
//!
//! - `input.read(n)`: up to `n` bytes as a blob (shorter at end of stream)
//! - `input.read_byte()`: the next byte, or `-1` at end of stream
//! - `input.skip(n)`: discards up to `n` bytes, returning how many were skipped
//! - `input.eof()`: true when no bytes remain
//! - `input.position()`: bytes consumed so far

use rhai::{Blob, Dynamic, Engine, EvalAltResult, Position, INT};
use std::cell::RefCell;
use std::fmt;
use std::io::{self, BufRead, Read};
use std::rc::Rc;

/// Shared handle over an open input; clones read from the same position
#[derive(Clone)]
pub struct InputStream {
    inner: Rc<RefCell<StreamState>>,
}

struct StreamState {
    reader: Box<dyn BufRead>,
    position: u64,
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl InputStream {
    /// Wraps a buffered reader
    pub fn new(reader: impl BufRead + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamState {
                reader: Box::new(reader),
                position: 0,
            })),
        }
    }

    /// Reads up to `len` bytes
    pub fn read(&self, len: usize) -> io::Result<Vec<u8>> {
        let mut state = self.inner.borrow_mut();
        let mut buf = Vec::with_capacity(len.min(64 * 1024));
        state.reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
        state.position += buf.len() as u64;
        Ok(buf)
    }

    /// Reads one byte, `None` at end of stream
    pub fn read_byte(&self) -> io::Result<Option<u8>> {
        let byte = self.read(1)?;
        Ok(byte.first().copied())
    }

    /// Discards up to `len` bytes
    pub fn skip(&self, len: usize) -> io::Result<u64> {
        let mut state = self.inner.borrow_mut();
        let skipped = io::copy(&mut state.reader.by_ref().take(len as u64), &mut io::sink())?;
        state.position += skipped;
        Ok(skipped)
    }

    /// Returns true when no bytes remain
    pub fn at_eof(&self) -> io::Result<bool> {
        let mut state = self.inner.borrow_mut();
        Ok(state.reader.fill_buf()?.is_empty())
    }

    /// Bytes consumed so far
    pub fn position(&self) -> u64 {
        self.inner.borrow().position
    }
}

fn script_error(err: io::Error) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(format!("input stream: {err}")),
        Position::NONE,
    ))
}

fn to_len(n: INT) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Registers the `InputStream` type and its methods
pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<InputStream>("InputStream")
        .register_fn(
            "read",
            |s: &mut InputStream, n: INT| -> Result<Blob, Box<EvalAltResult>> {
                s.read(to_len(n)).map_err(script_error)
            },
        )
        .register_fn(
            "read_byte",
            |s: &mut InputStream| -> Result<INT, Box<EvalAltResult>> {
                Ok(s.read_byte().map_err(script_error)?.map_or(-1, INT::from))
            },
        )
        .register_fn(
            "skip",
            |s: &mut InputStream, n: INT| -> Result<INT, Box<EvalAltResult>> {
                let skipped = s.skip(to_len(n)).map_err(script_error)?;
                Ok(INT::try_from(skipped).unwrap_or(INT::MAX))
            },
        )
        .register_fn(
            "eof",
            |s: &mut InputStream| -> Result<bool, Box<EvalAltResult>> {
                s.at_eof().map_err(script_error)
            },
        )
        .register_fn("position", |s: &mut InputStream| -> INT {
            INT::try_from(s.position()).unwrap_or(INT::MAX)
        });
}
