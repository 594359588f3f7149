//! Request/response correlation over the single outbound write path.
//!
//! Every request gets the next sequence number and a `PendingRequest` entry
//! in the correlation map before it is written. Responses are matched by
//! `request_seq` only; the listener thread removes the entry and runs its
//! callbacks, then signals any synchronous waiter.

use std::cmp;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use log::{debug, warn};
use serde_json as json;

use crate::session::SessionCore;
use crate::wire::{self, Response};

pub(crate) type SuccessFn = Box<dyn FnOnce(&Arc<SessionCore>, &Response) + Send>;
pub(crate) type FailureFn = Box<dyn FnOnce(&Arc<SessionCore>, Option<&Response>) + Send>;

/// A boolean continuation: backtrace done(running), hit test done(counted),
/// removal done(ok).
pub(crate) type Continuation = Box<dyn FnOnce(&Arc<SessionCore>, bool) + Send>;

/// What to run when the response arrives. `failure` also runs when the
/// request never made it onto the wire (`None` response).
pub(crate) struct ResponseHandler {
    pub success: Option<SuccessFn>,
    pub failure: Option<FailureFn>,
}

impl ResponseHandler {
    pub fn none() -> ResponseHandler {
        ResponseHandler {
            success: None,
            failure: None,
        }
    }

    pub fn on_success(
        success: impl FnOnce(&Arc<SessionCore>, &Response) + Send + 'static,
    ) -> ResponseHandler {
        ResponseHandler {
            success: Some(Box::new(success)),
            failure: None,
        }
    }

    pub fn new(
        success: impl FnOnce(&Arc<SessionCore>, &Response) + Send + 'static,
        failure: impl FnOnce(&Arc<SessionCore>, Option<&Response>) + Send + 'static,
    ) -> ResponseHandler {
        ResponseHandler {
            success: Some(Box::new(success)),
            failure: Some(Box::new(failure)),
        }
    }

    /// One callback for both outcomes. `Err` carries the failure response
    /// when the engine sent one, `None` when the request never made the
    /// wire. Exactly one branch ever runs, so the callback is shared
    /// through a take-once slot.
    pub fn on_result(
        handler: impl FnOnce(&Arc<SessionCore>, Result<&Response, Option<&Response>>) + Send + 'static,
    ) -> ResponseHandler {
        let slot = Arc::new(std::sync::Mutex::new(Some(handler)));
        let on_failure = Arc::clone(&slot);
        ResponseHandler {
            success: Some(Box::new(move |core, response| {
                if let Some(handler) = slot.lock().unwrap().take() {
                    handler(core, Ok(response));
                }
            })),
            failure: Some(Box::new(move |core, response| {
                if let Some(handler) = on_failure.lock().unwrap().take() {
                    handler(core, Err(response));
                }
            })),
        }
    }
}

/// Synchronous wait policy. The short-circuit predicate lets an exiting
/// debuggee abandon the wait early instead of deadlocking the caller.
pub(crate) struct Wait {
    pub timeout: Duration,
    pub short_circuit: Option<Box<dyn Fn() -> bool + Send>>,
}

impl Wait {
    /// The standard 2-second validated wait, abandoned once the debuggee is
    /// gone.
    pub fn exit_guard(core: &Arc<SessionCore>) -> Wait {
        let core = Arc::clone(core);
        Wait {
            timeout: Duration::from_secs(2),
            short_circuit: Some(Box::new(move || core.has_exited())),
        }
    }
}

pub(crate) struct PendingRequest {
    command: String,
    handler: ResponseHandler,
    done: Option<crossbeam_channel::Sender<bool>>,
}

impl SessionCore {
    /// Send one request.
    ///
    /// Without a wait policy this is fire-and-forget and returns `true` as
    /// soon as the packet is written. With one, the call blocks until the
    /// response arrives (`true` iff the engine reported success), the
    /// timeout lapses, or the short-circuit predicate trips (`false`). A
    /// predicate that is already true skips the wire entirely and routes
    /// through the failure callback.
    pub(crate) fn send(
        self: &Arc<Self>,
        command: &str,
        arguments: Option<json::Value>,
        handler: ResponseHandler,
        wait: Option<Wait>,
    ) -> bool {
        if let Some(Wait {
            short_circuit: Some(predicate),
            ..
        }) = &wait
        {
            if predicate() {
                if let Some(failure) = handler.failure {
                    failure(self, None);
                }
                return false;
            }
        }

        let (done_tx, done_rx) = match &wait {
            Some(_) => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let seq = {
            let mut state = self.state();
            if state.terminated {
                if let Some(failure) = handler.failure {
                    drop(state);
                    failure(self, None);
                }
                return false;
            }
            state.seq += 1;
            let seq = state.seq;
            state.pending.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    handler,
                    done: done_tx,
                },
            );
            seq
        };

        let mut packet = json::json!({ "seq": seq, "type": "request", "command": command });
        if let Some(arguments) = arguments {
            packet["arguments"] = arguments;
        }

        let written = {
            let mut writer = self.writer.lock().unwrap();
            match writer.as_mut() {
                Some(stream) => wire::write_packet(stream, &packet).is_ok(),
                None => false,
            }
        };
        if !written {
            // socket failure: fail locally, never wait
            let pending = self.state().pending.remove(&seq);
            if let Some(pending) = pending {
                if let Some(failure) = pending.handler.failure {
                    failure(self, None);
                }
            }
            return false;
        }

        let (Some(wait), Some(done_rx)) = (wait, done_rx) else {
            return true;
        };

        match wait.short_circuit {
            None => done_rx.recv_timeout(wait.timeout).unwrap_or(false),
            Some(predicate) => {
                // poll the predicate at a tenth of the budget so an exiting
                // process cannot hold the caller for the full timeout
                let interval =
                    Duration::from_millis(cmp::max(1, wait.timeout.as_millis() as u64 / 10));
                let deadline = Instant::now() + wait.timeout;
                loop {
                    match done_rx.recv_timeout(interval) {
                        Ok(success) => return success,
                        Err(RecvTimeoutError::Disconnected) => return false,
                        Err(RecvTimeoutError::Timeout) => {
                            if predicate() || Instant::now() >= deadline {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Match one response to its pending request and run it. Also reaps
    /// entries whose synchronous caller has already timed out.
    pub(crate) fn deliver(self: &Arc<Self>, response: Response) {
        let pending = self.state().pending.remove(&response.request_seq);
        let Some(pending) = pending else {
            warn!("response for unknown request {}", response.request_seq);
            return;
        };

        if response.success {
            if let Some(success) = pending.handler.success {
                success(self, &response);
            }
        } else {
            debug!(
                "{} failed: {}",
                pending.command,
                response.message.as_deref().unwrap_or("(no message)")
            );
            if let Some(failure) = pending.handler.failure {
                failure(self, Some(&response));
            }
        }

        // signal after the callbacks so synchronous results are in place
        if let Some(done) = pending.done {
            let _ = done.send(response.success);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use crate::mock_engine::{attach_pair, idle_engine};
    use crate::router::{ResponseHandler, Wait};
    use std::time::Duration;

    #[test]
    fn tripped_short_circuit_skips_the_wire() {
        let (core, _events, engine) = attach_pair(idle_engine());

        let failed = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&failed);
        let wait = Wait {
            timeout: Duration::from_secs(2),
            short_circuit: Some(Box::new(|| true)),
        };

        let started = Instant::now();
        let ok = core.send(
            "listbreakpoints",
            None,
            ResponseHandler::new(
                |_core, _response| panic!("request must not reach the wire"),
                move |_core, response| {
                    assert!(response.is_none());
                    observed.store(true, Ordering::SeqCst);
                },
            ),
            Some(wait),
        );

        assert!(!ok);
        assert!(failed.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_millis(500));

        core.terminate();
        engine.join().unwrap();
    }

    #[test]
    fn send_without_socket_fails_without_waiting() {
        let (core, _events, engine) = attach_pair(idle_engine());
        core.terminate();
        engine.join().unwrap();

        let started = Instant::now();
        let ok = core.send(
            "suspend",
            None,
            ResponseHandler::none(),
            Some(Wait {
                timeout: Duration::from_secs(2),
                short_circuit: None,
            }),
        );
        assert!(!ok);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
