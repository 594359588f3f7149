//! Break-event orchestration: reconciling a stop with stepping state,
//! breakpoint bindings, and the entry-point discipline.
//!
//! Everything here runs on the listener thread, so every request it issues
//! is callback-carrying, never a blocking wait. The per-binding pipeline
//! (hit count, policy, condition, re-bind) is an explicit [`BreakSequence`]
//! value threaded through the continuations instead of a closure pyramid.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json as json;

use crate::event::DebugEvent;
use crate::router::Continuation;
use crate::session::{SessionCore, StepKind};
use crate::wire::WireEvent;

/// Where a user step currently stands.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SteppingState {
    pub mode: Option<StepKind>,
    /// Frame count observed when the step was initiated. Used to detect
    /// stepping across a tracepoint that fired in a deeper frame.
    pub frame_depth_at_step: u32,
    /// Set when the stop being resumed was not the step's own completion.
    pub resuming: bool,
}

/// What to do when a break produced no counting hit.
pub(crate) enum NoHitAction {
    AutoResume,
    /// First-resume case: the stop is the entry point.
    EntryPoint,
}

/// The in-flight state of one break being processed: bindings still to
/// examine, bindings whose hit counted, and the fallback action.
pub(crate) struct BreakSequence {
    queue: VecDeque<i64>,
    hit: Vec<i64>,
    test_fully_bound: bool,
    no_hit: NoHitAction,
}

impl SessionCore {
    /// Inbound `break` event: map the reported breakpoint ids to bindings,
    /// refresh the backtrace, then process the stop.
    pub(crate) fn handle_break_event(self: &Arc<Self>, event: WireEvent) {
        let engine_ids: Option<Vec<i64>> = event
            .body
            .as_ref()
            .and_then(|body| body.get("breakpoints"))
            .and_then(json::Value::as_array)
            .map(|ids| ids.iter().filter_map(json::Value::as_i64).collect());

        self.perform_backtrace(Box::new(move |core, running| {
            debug_assert!(!running);
            let bindings = engine_ids.map(|ids| {
                let state = core.state();
                // ids the engine knows but we do not are dropped silently
                ids.into_iter()
                    .filter(|id| state.bindings.contains_key(id))
                    .collect::<VecDeque<i64>>()
            });
            core.process_break(bindings, NoHitAction::AutoResume, true);
        }));
    }

    /// The stop trichotomy: no breakpoint array means a step completed, an
    /// empty one means nothing we know hit, otherwise each binding gets its
    /// say.
    pub(crate) fn process_break(
        self: &Arc<Self>,
        bindings: Option<VecDeque<i64>>,
        no_hit: NoHitAction,
        test_fully_bound: bool,
    ) {
        match bindings {
            None => self.complete_stepping(),
            Some(queue) => self.advance_break_sequence(BreakSequence {
                queue,
                hit: Vec::new(),
                test_fully_bound,
                no_hit,
            }),
        }
    }

    /// Work through the sequence until it needs a response, handing itself
    /// to the continuation of whatever request it sends.
    fn advance_break_sequence(self: &Arc<Self>, mut sequence: BreakSequence) {
        loop {
            let Some(engine_id) = sequence.queue.pop_front() else {
                self.finish_break_sequence(sequence);
                return;
            };

            let binding = {
                let state = self.state();
                state
                    .bindings
                    .get(&engine_id)
                    .map(|binding| (binding.fully_bound, binding.breakpoint))
            };
            let Some((fully_bound, breakpoint)) = binding else {
                continue;
            };

            if fully_bound {
                if !sequence.test_fully_bound {
                    sequence.hit.push(engine_id);
                    continue;
                }
                self.test_and_process_hit(
                    engine_id,
                    Box::new(move |core, counted| {
                        let mut sequence = sequence;
                        if counted {
                            sequence.hit.push(engine_id);
                        }
                        core.advance_break_sequence(sequence);
                    }),
                );
                return;
            }

            self.rebind_and_test(engine_id, breakpoint, sequence);
            return;
        }
    }

    /// A partially bound binding fired: re-bind it fresh, and count the hit
    /// only if the new location is the line we are actually stopped on.
    /// Anything else is the lambda/eval fix-up case and stays silent.
    fn rebind_and_test(
        self: &Arc<Self>,
        engine_id: i64,
        breakpoint: crate::BreakpointId,
        sequence: BreakSequence,
    ) {
        self.remove_binding(
            engine_id,
            Box::new(move |core, _removed| {
                let Some(spec) = core.breakpoint_spec(breakpoint) else {
                    core.advance_break_sequence(sequence);
                    return;
                };
                core.set_breakpoint_request(
                    &spec,
                    false,
                    Box::new(move |core, outcome| {
                        let Some((engine_id, script_id, line_no)) = outcome else {
                            core.advance_break_sequence(sequence);
                            return;
                        };

                        // the re-bound binding counts as fully bound
                        core.install_binding(breakpoint, engine_id, script_id, line_no, true);
                        core.emit(DebugEvent::BreakpointBound {
                            breakpoint,
                            engine_id,
                            line_no,
                        });

                        let top_line = core
                            .state()
                            .thread
                            .frames
                            .first()
                            .map(|frame| frame.line_no);
                        if top_line != Some(line_no) {
                            core.advance_break_sequence(sequence);
                            return;
                        }
                        core.test_and_process_hit(
                            engine_id,
                            Box::new(move |core, counted| {
                                let mut sequence = sequence;
                                if counted {
                                    sequence.hit.push(engine_id);
                                }
                                core.advance_break_sequence(sequence);
                            }),
                        );
                    }),
                );
            }),
        );
    }

    fn finish_break_sequence(self: &Arc<Self>, sequence: BreakSequence) {
        if sequence.hit.is_empty() {
            match sequence.no_hit {
                NoHitAction::AutoResume => self.auto_resume(false),
                NoHitAction::EntryPoint => {
                    self.state().handle_entry_point_hit = false;
                    self.emit(DebugEvent::EntryPointHit);
                }
            }
            return;
        }

        for engine_id in sequence.hit {
            self.process_breakpoint_hit(engine_id);
        }
    }

    /// Decide whether a binding's hit counts: engine hit count against the
    /// policy, then the condition predicate.
    fn test_and_process_hit(self: &Arc<Self>, engine_id: i64, done: Continuation) {
        let snapshot = {
            let state = self.state();
            state.bindings.get(&engine_id).and_then(|binding| {
                let record = state.breakpoints.get(&binding.breakpoint)?;
                Some((record.spec.enabled, record.spec.break_on, record.spec.condition.clone()))
            })
        };
        let Some((enabled, break_on, condition)) = snapshot else {
            done(self, false);
            return;
        };
        if !enabled {
            done(self, false);
            return;
        }

        self.fetch_hit_count(
            engine_id,
            Box::new(move |core, fetched| {
                if fetched {
                    let hit_count = core
                        .state()
                        .bindings
                        .get(&engine_id)
                        .map(|binding| binding.hit_count)
                        .unwrap_or(0);
                    if !break_on.should_break(hit_count) {
                        done(core, false);
                        return;
                    }
                }
                // a failed count query surfaces the stop rather than
                // swallowing it

                match condition {
                    None => done(core, true),
                    Some(condition) => core.test_predicate(&condition, done),
                }
            }),
        );
    }

    /// Side effects of a counting hit: push the policy's new engine
    /// projection if it drifted, then surface the stop.
    fn process_breakpoint_hit(self: &Arc<Self>, engine_id: i64) {
        let update = {
            let mut state = self.state();
            let Some(binding) = state.bindings.get(&engine_id) else {
                return;
            };
            let breakpoint = binding.breakpoint;
            let hit_count = binding.hit_count;
            let Some(record) = state.breakpoints.get(&breakpoint) else {
                return;
            };
            let enabled = record.spec.break_on.engine_enabled(record.spec.enabled, hit_count);
            let ignore_count = record.spec.break_on.engine_ignore_count(hit_count);

            let binding = state.bindings.get_mut(&engine_id).unwrap();
            let drifted =
                enabled != binding.engine_enabled || ignore_count != binding.engine_ignore_count;
            binding.engine_enabled = enabled;
            binding.engine_ignore_count = ignore_count;
            (breakpoint, drifted, enabled, ignore_count)
        };

        let (breakpoint, drifted, enabled, ignore_count) = update;
        if drifted {
            self.change_breakpoint_request(engine_id, Some(enabled), None, Some(ignore_count), false);
        }
        self.emit(DebugEvent::BreakpointHit {
            breakpoint,
            engine_id,
        });
    }

    /// Finish (or keep chasing) the active step.
    ///
    /// While resuming across a stop that was not the step's own completion,
    /// a deeper current frame means a tracepoint fired inside a call the
    /// step was supposed to glide over: keep going with `out` and leave the
    /// stepping state untouched, so the one step neither gets lost nor
    /// completes twice.
    pub(crate) fn complete_stepping(self: &Arc<Self>) {
        {
            let mut state = self.state();
            let depth = state.thread.frames.len() as u32;
            if state.stepping.resuming {
                let deeper = match state.stepping.mode {
                    Some(StepKind::Over) => depth > state.stepping.frame_depth_at_step,
                    Some(StepKind::Out) => depth + 1 > state.stepping.frame_depth_at_step,
                    Some(StepKind::Into) | None => false,
                };
                if deeper {
                    drop(state);
                    self.continue_with(Some(StepKind::Out), false);
                    return;
                }
            }
            state.stepping = SteppingState::default();
        }
        self.emit(DebugEvent::StepComplete);
    }

    /// Resume from a stop the user never asked to see. Folds into the
    /// stepping state machine when a step is active.
    pub(crate) fn auto_resume(self: &Arc<Self>, need_backtrace: bool) {
        let stepping = self.state().stepping.mode.is_some();
        if !stepping {
            self.continue_with(None, false);
            return;
        }

        if need_backtrace {
            self.perform_backtrace(Box::new(|core, _running| {
                core.state().stepping.resuming = true;
                core.complete_stepping();
            }));
        } else {
            self.state().stepping.resuming = true;
            self.complete_stepping();
        }
    }

    /// The resume entry point, with the first-resume and armed-entry-point
    /// special cases.
    pub(crate) fn send_resume_thread(self: &Arc<Self>) {
        let mut state = self.state();
        if !state.load_complete_handled {
            state.load_complete_handled = true;
            state.handle_entry_point_hit = false;

            // any enabled binding sitting on the entry line gets a say
            // before the entry point is reported
            let matched: VecDeque<i64> = match state.thread.frames.first() {
                Some(top) => {
                    let line_no = top.line_no;
                    let file = top.script.name.to_lowercase();
                    state
                        .bindings
                        .values()
                        .filter(|binding| {
                            !binding.unbound
                                && binding.line_no == line_no
                                && state
                                    .breakpoints
                                    .get(&binding.breakpoint)
                                    .map(|record| {
                                        record.spec.enabled
                                            && record.spec.file_name.to_lowercase() == file
                                    })
                                    .unwrap_or(false)
                        })
                        .map(|binding| binding.engine_id)
                        .collect()
                }
                None => VecDeque::new(),
            };

            if matched.is_empty() {
                drop(state);
                self.emit(DebugEvent::EntryPointHit);
                return;
            }

            // arm the entry-point hit so a tracepoint at the entry line
            // reports it on the next resume
            state.handle_entry_point_hit = true;
            drop(state);
            self.process_break(Some(matched), NoHitAction::EntryPoint, true);
            return;
        }

        if state.handle_entry_point_hit {
            state.handle_entry_point_hit = false;
            drop(state);
            self.emit(DebugEvent::EntryPointHit);
            return;
        }

        drop(state);
        self.auto_resume(false);
    }
}
