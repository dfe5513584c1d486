pub mod attribution;
pub mod batch;

use crate::resolve::SourceLine;
use std::collections::HashMap;

pub use attribution::Engine;

/// How the scan of the target invocation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The outermost invocation returned
    Completed,
    /// The trace stopped (or left for an unrelated function) while still
    /// inside the target. `last_line` is where it was when that happened.
    AbnormalTermination { last_line: Option<SourceLine> },
    /// The target was never called
    NotEntered,
}

/// Instructions executed by one invocation of the target function, per
/// source line. Calls made by the target are charged to the calling line.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribution {
    /// discriminators already merged
    pub line_counts: HashMap<SourceLine, u64>,
    /// executed in scope, but not charged to any line
    pub unattributed: u64,
    pub termination: Termination,
    /// runtime address of the last instruction consumed in scope
    pub last_address: Option<u64>,
}

impl Attribution {
    pub fn not_entered() -> Self {
        Self {
            line_counts: HashMap::new(),
            unattributed: 0,
            termination: Termination::NotEntered,
            last_address: None,
        }
    }

    /// Instructions charged to some line
    pub fn total_instructions(&self) -> u64 {
        self.line_counts.values().sum()
    }

    pub fn crash_detected(&self) -> bool {
        matches!(self.termination, Termination::AbnormalTermination { .. })
    }

    pub fn crash_line(&self) -> Option<&SourceLine> {
        match &self.termination {
            Termination::AbnormalTermination { last_line } => last_line.as_ref(),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, line: &str) -> u64 {
        self.line_counts
            .get(&SourceLine::new(line))
            .copied()
            .unwrap_or(0)
    }
}

/// Which entry address of the target could not be found
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum EntryKind {
    #[strum(to_string = "static")]
    Static,
    #[strum(to_string = "runtime")]
    Runtime,
}

#[derive(thiserror::Error, Debug)]
pub enum AttributionError {
    #[error("no {kind} address for `{function}`")]
    MissingTargetAddress { function: String, kind: EntryKind },
}
