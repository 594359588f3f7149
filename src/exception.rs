//! Exception filtering: the per-name treatment table and the engine's
//! all-or-nothing exception break switch.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json as json;

use crate::event::DebugEvent;
use crate::router::{ResponseHandler, Wait};
use crate::session::SessionCore;
use crate::wire::{self, WireEvent};
use crate::Error;

/// What to do when an exception of a given name is thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionTreatment {
    BreakNever,
    BreakAlways,
    /// Reserved. The engine reports no reliable "uncaught" signal over this
    /// protocol, so storing this in the table is rejected.
    BreakOnUnhandled,
}

const WELL_KNOWN_ERRORS: &[&str] = &[
    "Error",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
];

const ERRNO_CODES: &[&str] = &[
    "EACCES", "EADDRINUSE", "EADDRNOTAVAIL", "EAFNOSUPPORT", "EAGAIN", "EWOULDBLOCK", "EALREADY",
    "EBADF", "EBADMSG", "EBUSY", "ECANCELED", "ECHILD", "ECONNABORTED", "ECONNREFUSED",
    "ECONNRESET", "EDEADLK", "EDESTADDRREQ", "EDOM", "EEXIST", "EFAULT", "EFBIG", "EHOSTUNREACH",
    "EIDRM", "EILSEQ", "EINPROGRESS", "EINTR", "EINVAL", "EIO", "EISCONN", "EISDIR", "ELOOP",
    "EMFILE", "EMLINK", "EMSGSIZE", "ENAMETOOLONG", "ENETDOWN", "ENETRESET", "ENETUNREACH",
    "ENFILE", "ENOBUFS", "ENODATA", "ENODEV", "ENOENT", "ENOEXEC", "ENOLINK", "ENOLCK", "ENOMEM",
    "ENOMSG", "ENOPROTOOPT", "ENOSPC", "ENOSR", "ENOSTR", "ENOSYS", "ENOTCONN", "ENOTDIR",
    "ENOTEMPTY", "ENOTSOCK", "ENOTSUP", "ENOTTY", "ENXIO", "EOVERFLOW", "EPERM", "EPIPE",
    "EPROTO", "EPROTONOSUPPORT", "EPROTOTYPE", "ERANGE", "EROFS", "ESPIPE", "ESRCH", "ETIME",
    "ETIMEDOUT", "ETXTBSY", "EXDEV",
];

const SIGNAL_CODES: &[&str] = &[
    "SIGHUP", "SIGINT", "SIGILL", "SIGABRT", "SIGFPE", "SIGKILL", "SIGSEGV", "SIGTERM",
    "SIGBREAK", "SIGWINCH",
];

/// The table a fresh session starts with: break on every well-known error
/// and every `Error(code)` variant, except `Error(ENOENT)` which is routine
/// enough to stay quiet.
pub(crate) fn default_treatments() -> HashMap<String, ExceptionTreatment> {
    let mut table = HashMap::new();
    for name in WELL_KNOWN_ERRORS {
        table.insert((*name).to_string(), ExceptionTreatment::BreakAlways);
    }
    for code in ERRNO_CODES.iter().chain(SIGNAL_CODES) {
        table.insert(format!("Error({})", code), ExceptionTreatment::BreakAlways);
    }
    table.insert("Error(ENOENT)".to_string(), ExceptionTreatment::BreakNever);
    table
}

fn storable(treatment: ExceptionTreatment) -> Result<(), Error> {
    if treatment == ExceptionTreatment::BreakOnUnhandled {
        return Err(Error::UnsupportedTreatment);
    }
    Ok(())
}

impl SessionCore {
    pub(crate) fn set_exception_treatment(
        self: &Arc<Self>,
        name: &str,
        treatment: ExceptionTreatment,
    ) -> Result<(), Error> {
        storable(treatment)?;
        let changed = {
            let mut state = self.state();
            state.treatments.insert(name.to_string(), treatment) != Some(treatment)
        };
        if changed {
            self.configure_exception_break(true);
        }
        Ok(())
    }

    pub(crate) fn set_default_exception_treatment(
        self: &Arc<Self>,
        treatment: ExceptionTreatment,
    ) -> Result<(), Error> {
        storable(treatment)?;
        let changed = {
            let mut state = self.state();
            let changed = state.default_treatment != treatment;
            state.default_treatment = treatment;
            changed
        };
        if changed {
            self.configure_exception_break(true);
        }
        Ok(())
    }

    pub(crate) fn clear_exception_treatment(self: &Arc<Self>, name: &str) {
        let changed = {
            let mut state = self.state();
            let default = state.default_treatment;
            state.treatments.remove(name).map(|old| old != default)
        };
        if changed.unwrap_or(false) {
            self.configure_exception_break(true);
        }
    }

    pub(crate) fn clear_exception_treatments(self: &Arc<Self>) {
        let changed = {
            let mut state = self.state();
            let default = state.default_treatment;
            let changed = state.treatments.values().any(|treatment| *treatment != default);
            state.treatments.clear();
            changed
        };
        if changed {
            self.configure_exception_break(true);
        }
    }

    /// Push the derived break-on-all state to the engine when it moved.
    /// `breakOnUncaught` is derived too, for symmetry, even though nothing
    /// can turn it on today.
    pub(crate) fn configure_exception_break(self: &Arc<Self>, synchronous: bool) {
        let (break_on_all, break_on_uncaught, sent_all, sent_uncaught) = {
            let state = self.state();
            let break_on_all = state.default_treatment != ExceptionTreatment::BreakNever
                || state
                    .treatments
                    .values()
                    .any(|treatment| *treatment != ExceptionTreatment::BreakNever);
            (
                break_on_all,
                false,
                state.break_on_all_sent,
                state.break_on_uncaught_sent,
            )
        };

        if break_on_all != sent_all {
            self.send_exception_break("all", break_on_all, synchronous);
        }
        if break_on_uncaught != sent_uncaught {
            self.send_exception_break("uncaught", break_on_uncaught, synchronous);
        }
    }

    fn send_exception_break(self: &Arc<Self>, flavor: &'static str, enabled: bool, synchronous: bool) {
        let wait = synchronous.then(|| Wait::exit_guard(self));
        self.send(
            "setexceptionbreak",
            Some(json::json!({ "type": flavor, "enabled": enabled })),
            ResponseHandler::on_success(move |core, _response| {
                let mut state = core.state();
                match flavor {
                    "all" => state.break_on_all_sent = enabled,
                    _ => state.break_on_uncaught_sent = enabled,
                }
            }),
            wait,
        );
    }

    /// Inbound `exception` event.
    pub(crate) fn handle_exception_event(self: &Arc<Self>, event: WireEvent) {
        let Some(body) = event.body else { return };
        let refs = wire::index_refs(&event.refs);

        let uncaught = body
            .get("uncaught")
            .and_then(json::Value::as_bool)
            .unwrap_or(false);
        let exception = body.get("exception").cloned().unwrap_or(json::Value::Null);

        let mut name = exception
            .get("type")
            .and_then(json::Value::as_str)
            .unwrap_or("Error")
            .to_string();
        // generic records are upgraded to their constructor's name
        if name == "error" || name == "object" {
            let constructor = exception
                .get("constructorFunction")
                .and_then(|function| function.get("ref"))
                .and_then(json::Value::as_i64)
                .and_then(|handle| refs.get(&handle))
                .and_then(|record| record.get("name"))
                .and_then(json::Value::as_str);
            if let Some(constructor) = constructor {
                name = constructor.to_string();
            }
        }

        let description = exception
            .get("text")
            .and_then(json::Value::as_str)
            .unwrap_or("")
            .to_string();

        let code_handle = exception
            .get("properties")
            .and_then(json::Value::as_array)
            .and_then(|properties| {
                properties.iter().find(|property| {
                    property.get("name").and_then(json::Value::as_str) == Some("code")
                })
            })
            .and_then(|property| property.get("ref"))
            .and_then(json::Value::as_i64);

        let Some(code_handle) = code_handle else {
            self.report_exception(name, None, description, uncaught);
            return;
        };

        let cached = self.state().error_codes.get(&code_handle).cloned();
        if let Some(code) = cached {
            self.report_exception(name, Some(code), description, uncaught);
            return;
        }

        self.lookup(
            vec![code_handle],
            Box::new(move |core, lookup_body| {
                let code = lookup_body
                    .as_ref()
                    .and_then(|body| body.get(code_handle.to_string()))
                    .and_then(|record| {
                        record
                            .get("text")
                            .or_else(|| record.get("value"))
                            .and_then(json::Value::as_str)
                    })
                    .map(str::to_string);
                if let Some(code) = &code {
                    core.state().error_codes.insert(code_handle, code.clone());
                }
                core.report_exception(name, code, description, uncaught);
            }),
        );
    }

    /// Apply the treatment table to a composed exception name and either
    /// resume quietly or surface the stop with frames populated.
    fn report_exception(
        self: &Arc<Self>,
        base_name: String,
        code: Option<String>,
        description: String,
        uncaught: bool,
    ) {
        let name = match code {
            Some(code) if !code.is_empty() => format!("{}({})", base_name, code),
            _ => base_name,
        };

        let treatment = {
            let state = self.state();
            state
                .treatments
                .get(&name)
                .copied()
                .unwrap_or(state.default_treatment)
        };
        if treatment == ExceptionTreatment::BreakNever {
            self.auto_resume(true);
            return;
        }

        self.perform_backtrace(Box::new(move |core, _running| {
            core.emit(DebugEvent::ExceptionRaised {
                name,
                description,
                uncaught,
            });
        }));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_cover_every_listed_name() {
        let table = default_treatments();
        // one entry per listed name; ENOENT is flipped in place, not added
        assert_eq!(
            table.len(),
            WELL_KNOWN_ERRORS.len() + ERRNO_CODES.len() + SIGNAL_CODES.len()
        );
        assert_eq!(table["TypeError"], ExceptionTreatment::BreakAlways);
        assert_eq!(table["Error(EPIPE)"], ExceptionTreatment::BreakAlways);
        assert_eq!(table["Error(SIGWINCH)"], ExceptionTreatment::BreakAlways);
        assert_eq!(table["Error(ENOENT)"], ExceptionTreatment::BreakNever);
    }

    #[test]
    fn unhandled_treatment_is_rejected() {
        assert!(storable(ExceptionTreatment::BreakOnUnhandled).is_err());
        assert!(storable(ExceptionTreatment::BreakAlways).is_ok());
        assert!(storable(ExceptionTreatment::BreakNever).is_ok());
    }
}
