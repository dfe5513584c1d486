//! Reading the debugger's per-instruction log.
//!
//! The tracer writes one line per executed instruction, prefixed by the
//! enclosing function, plus `[CALL]` markers in front of calls and a
//! `TEXT_BASE` header. Anything else is noise and gets classified as
//! [`TraceLine::Unparseable`].

use crate::arch::BranchPolicy;
use std::io::BufRead;
use tracing::{debug, warn};

use self::parser::TraceLine;

pub mod parser;

/// Forward-only cursor over a trace, with room to put back one line.
pub struct TraceCursor<R> {
    reader: R,
    buf: Vec<u8>,
    pushed: Option<TraceLine>,
    /// physical lines read so far
    line_no: usize,
    done: bool,
}

impl<R: BufRead> TraceCursor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pushed: None,
            line_no: 0,
            done: false,
        }
    }

    /// Hands `line` out again on the next call to `next`. Only one line can
    /// be held at a time.
    pub fn push_back(&mut self, line: TraceLine) {
        debug_assert!(self.pushed.is_none(), "cursor already holds a line");
        self.pushed = Some(line);
    }

    pub fn line_no(&self) -> usize {
        self.line_no
    }

    fn read_line(&mut self) -> Option<TraceLine> {
        if self.done {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.line_no += 1;
                // gdb sometimes prints inferior output with odd bytes in it
                let text = String::from_utf8_lossy(&self.buf);
                Some(parser::parse_line(text.trim_end_matches(['\n', '\r'])))
            }
            Err(e) => {
                warn!("trace unreadable after line {}: {}", self.line_no, e);
                self.done = true;
                None
            }
        }
    }
}

impl<R: BufRead> Iterator for TraceCursor<R> {
    type Item = TraceLine;

    fn next(&mut self) -> Option<Self::Item> {
        self.pushed.take().or_else(|| self.read_line())
    }
}

/// Where `function` was loaded in the traced process: the destination of the
/// first call to it.
pub fn find_runtime_entry<R, P>(reader: R, function: &str, policy: &P) -> Option<u64>
where
    R: BufRead,
    P: BranchPolicy,
{
    let entry = TraceCursor::new(reader).find_map(|line| match line {
        TraceLine::Instruction(insn) if policy.is_call(&insn) => {
            if insn.branches_to_start_of(function) {
                insn.branch_address()
            } else {
                None
            }
        }
        _ => None,
    });

    if let Some(entry) = entry {
        debug!("runtime address of `{}`: {:#x}", function, entry);
    }

    entry
}

/// The `TEXT_BASE` header, if the tracer wrote one before the first
/// instruction.
pub fn find_text_base<R: BufRead>(reader: R) -> Option<u64> {
    TraceCursor::new(reader)
        .take_while(|line| !matches!(line, TraceLine::Instruction(_)))
        .find_map(|line| match line {
            TraceLine::TextBase(base) => Some(base),
            _ => None,
        })
}
