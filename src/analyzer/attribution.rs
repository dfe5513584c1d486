use super::{Attribution, Termination};
use crate::{
    arch::BranchPolicy,
    resolve::{normalize_discriminators, AddressResolver, LineOracle, SourceLine},
    tracer::{
        parser::{Instruction, TraceLine},
        TraceCursor,
    },
};
use std::{collections::HashMap, io::BufRead};
use tracing::{debug, info, trace, warn};

/// Live bookkeeping while inside the target function
#[derive(Debug, Default)]
struct AttributionState {
    /// open self-invocations below the outermost one
    target_recursion_depth: u32,
    last_line: Option<SourceLine>,
    line_counts: HashMap<SourceLine, u64>,
    unattributed: u64,
    last_address: Option<u64>,
}

impl AttributionState {
    fn record<O: LineOracle>(&mut self, insn: &Instruction, resolver: &mut AddressResolver<O>) {
        self.last_address = Some(insn.address);

        match resolver.resolve(insn.address) {
            Some(line) => {
                *self.line_counts.entry(line.clone()).or_insert(0) += 1;
                self.last_line = Some(line);
            }
            None => self.unattributed += 1,
        }
    }

    /// The call site pays for everything the callee did
    fn charge_call(&mut self, cost: &NestedCost) {
        if cost.last_address.is_some() {
            self.last_address = cost.last_address;
        }

        match &self.last_line {
            Some(line) => *self.line_counts.entry(line.clone()).or_insert(0) += cost.instructions,
            None => self.unattributed += cost.instructions,
        }
    }

    fn finish(self, termination: Termination) -> Attribution {
        Attribution {
            line_counts: normalize_discriminators(self.line_counts),
            unattributed: self.unattributed,
            termination,
            last_address: self.last_address,
        }
    }
}

/// What a call made from the target cost, see [`Engine::nested_cost`].
#[derive(Debug, PartialEq)]
pub struct NestedCost {
    pub instructions: u64,
    /// The line that ended the callee's scope. It still has to be looked at
    /// by the caller. `None` if the trace ran out first.
    pub resume: Option<TraceLine>,
    pub last_address: Option<u64>,
}

/// Attributes one invocation of `target` to source lines.
pub struct Engine<'a, O, P> {
    target: &'a str,
    entry: u64,
    resolver: &'a mut AddressResolver<O>,
    policy: &'a P,
}

impl<'a, O, P> Engine<'a, O, P>
where
    O: LineOracle,
    P: BranchPolicy,
{
    pub fn new(target: &'a str, resolver: &'a mut AddressResolver<O>, policy: &'a P) -> Self {
        Self {
            target,
            entry: resolver.runtime_entry(),
            resolver,
            policy,
        }
    }

    pub fn run<R: BufRead>(mut self, cursor: &mut TraceCursor<R>) -> Attribution {
        if !self.seek_entry(cursor) {
            warn!("`{}` is never called in this trace", self.target);
            return Attribution::not_entered();
        }

        debug!("entered `{}` at line {}", self.target, cursor.line_no());

        let mut state = AttributionState::default();
        let termination = self.scan_target(cursor, &mut state);

        if let Termination::AbnormalTermination { last_line } = &termination {
            warn!(
                "trace ended inside `{}`, last line: {}",
                self.target,
                last_line
                    .as_ref()
                    .map_or_else(|| String::from("?"), SourceLine::to_string)
            );
        }

        let attribution = state.finish(termination);

        info!(
            "{} instructions in `{}` ({} unattributed, {} addresses resolved)",
            attribution.total_instructions(),
            self.target,
            attribution.unattributed,
            self.resolver.lookups()
        );

        attribution
    }

    /// Whether `insn`, a call, goes to the target itself. A known destination
    /// decides alone, `<f+5>` is a jump into the middle of `f`.
    fn calls_target(&self, insn: &Instruction, callee: Option<&str>) -> bool {
        match insn.branch_address() {
            Some(destination) => destination == self.entry,
            None => callee == Some(self.target),
        }
    }

    /// Skips ahead to the call into the target. Returns `false` if there is
    /// none.
    fn seek_entry<R: BufRead>(&self, cursor: &mut TraceCursor<R>) -> bool {
        let mut marker = None;

        for line in cursor.by_ref() {
            match line {
                TraceLine::CallMarker { callee, .. } => marker = Some(callee),
                TraceLine::Instruction(insn) => {
                    let marker = marker.take();
                    if !self.policy.is_call(&insn) {
                        continue;
                    }

                    let callee = insn.branch_symbol().map(str::to_string).or(marker);
                    if self.calls_target(&insn, callee.as_deref()) {
                        return true;
                    }
                }
                TraceLine::TextBase(_) | TraceLine::Unparseable => {}
            }
        }

        false
    }

    /// Function of the next instruction, which stays on the cursor. A marker
    /// in between belongs to that instruction and is handed back with it.
    fn peek_function<R: BufRead>(
        cursor: &mut TraceCursor<R>,
    ) -> (Option<String>, Option<String>) {
        let mut marker = None;

        while let Some(line) = cursor.next() {
            match line {
                TraceLine::Instruction(insn) => {
                    let function = insn.function.clone();
                    cursor.push_back(TraceLine::Instruction(insn));
                    return (Some(function), marker);
                }
                TraceLine::CallMarker { callee, .. } => marker = Some(callee),
                TraceLine::TextBase(_) | TraceLine::Unparseable => {}
            }
        }

        (None, marker)
    }

    fn abnormal(&mut self, state: &AttributionState) -> Termination {
        // prefer where exactly it died, even if that was below the target
        let last_line = state
            .last_address
            .and_then(|address| self.resolver.resolve(address))
            .or_else(|| state.last_line.clone());

        Termination::AbnormalTermination { last_line }
    }

    fn scan_target<R: BufRead>(
        &mut self,
        cursor: &mut TraceCursor<R>,
        state: &mut AttributionState,
    ) -> Termination {
        let mut marker = None;

        loop {
            let insn = match cursor.next() {
                Some(TraceLine::Instruction(insn)) => insn,
                Some(TraceLine::CallMarker { callee, .. }) => {
                    marker = Some(callee);
                    continue;
                }
                Some(TraceLine::TextBase(_) | TraceLine::Unparseable) => continue,
                None => return self.abnormal(state),
            };
            let pending = marker.take();

            if insn.function != self.target {
                // the epilogue of a callee handing control back
                if self.policy.is_return(&insn) {
                    state.unattributed += 1;
                    state.last_address = Some(insn.address);
                    continue;
                }

                debug!(
                    "`{}` left for `{}` at {:#x} without a call",
                    self.target, insn.function, insn.address
                );
                return self.abnormal(state);
            }

            state.record(&insn, self.resolver);

            if self.policy.is_call(&insn) {
                let mut callee = insn.branch_symbol().map(str::to_string).or(pending);

                // nothing names the destination, so look where execution went
                if callee.is_none() {
                    let (next, next_marker) = Self::peek_function(cursor);
                    callee = next;
                    marker = next_marker;
                }

                if self.calls_target(&insn, callee.as_deref()) {
                    state.target_recursion_depth += 1;
                    debug!(
                        ">>> `{}` recursion depth {}",
                        self.target, state.target_recursion_depth
                    );
                    continue;
                }

                let cost = self.callee_cost(cursor, callee.as_deref(), marker.take());
                debug!(
                    ">>> {} instructions in `{}` charged to {:?}",
                    cost.instructions,
                    callee.as_deref().unwrap_or("?"),
                    state.last_line
                );
                state.charge_call(&cost);

                match cost.resume {
                    Some(line) => cursor.push_back(line),
                    None => return self.abnormal(state),
                }
            } else if self.policy.is_return(&insn) {
                if state.target_recursion_depth == 0 {
                    return Termination::Completed;
                }

                state.target_recursion_depth -= 1;
                debug!(
                    "<<< `{}` recursion depth {}",
                    self.target, state.target_recursion_depth
                );
            }
        }
    }

    /// Counts every instruction of a call made by the target, down to any
    /// depth, until control is back in the target.
    ///
    /// `callee` is `None` for indirect calls the tracer couldn't name, then
    /// whatever function executes first is taken as the callee.
    pub fn nested_cost<R: BufRead>(
        &mut self,
        cursor: &mut TraceCursor<R>,
        callee: Option<&str>,
    ) -> NestedCost {
        self.callee_cost(cursor, callee, None)
    }

    /// [`Engine::nested_cost`], with the marker already read for the
    /// callee's first instruction
    fn callee_cost<R: BufRead>(
        &mut self,
        cursor: &mut TraceCursor<R>,
        callee: Option<&str>,
        mut marker: Option<String>,
    ) -> NestedCost {
        let mut callee = callee.map(str::to_string);
        // the callee calling itself
        let mut callee_depth = 0u32;
        // the target, entered again from somewhere below the callee
        let mut target_depth = 0u32;
        let mut instructions = 0;
        let mut last_address = None;

        while let Some(line) = cursor.next() {
            let insn = match line {
                TraceLine::Instruction(insn) => insn,
                TraceLine::CallMarker { callee, .. } => {
                    marker = Some(callee);
                    continue;
                }
                TraceLine::TextBase(_) | TraceLine::Unparseable => continue,
            };
            let pending = marker.take();
            let callee: &str = callee.get_or_insert_with(|| insn.function.clone());

            if insn.function == self.target {
                if target_depth == 0 {
                    // back in the caller without seeing the callee return
                    return NestedCost {
                        instructions,
                        resume: Some(TraceLine::Instruction(insn)),
                        last_address,
                    };
                }

                if self.policy.is_return(&insn) {
                    target_depth -= 1;
                }
            }

            if self.policy.is_call(&insn) {
                let mut destination = insn.branch_symbol().map(str::to_string).or(pending);

                // `call *%rax`, find out who was called from the next line
                if destination.is_none() {
                    let (next, next_marker) = Self::peek_function(cursor);
                    destination = next;
                    marker = next_marker;
                }

                if self.calls_target(&insn, destination.as_deref()) {
                    target_depth += 1;
                } else if destination.as_deref() == Some(callee) {
                    callee_depth += 1;
                }
            } else if insn.function == callee && self.policy.is_return(&insn) {
                if callee_depth == 0 {
                    return NestedCost {
                        instructions,
                        resume: Some(TraceLine::Instruction(insn)),
                        last_address,
                    };
                }

                callee_depth -= 1;
            }

            trace!("{} += {:#x}", callee, insn.address);
            instructions += 1;
            last_address = Some(insn.address);
        }

        NestedCost {
            instructions,
            resume: None,
            last_address,
        }
    }
}
