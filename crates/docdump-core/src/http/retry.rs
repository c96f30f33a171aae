use std::time::Duration;

use crate::error::{DumpError, Result, TransportKind};
use crate::options::Options;

/// Retry budget per call-site. Attempt number 101 must never happen.
pub const MAX_ATTEMPTS: usize = 100;

/// Logical error number the cluster reports for an internal timeout.
const ERROR_CLUSTER_TIMEOUT: i64 = 1457;

/// Whether a failed exchange is worth repeating: transport-level connect,
/// read and write failures, plus gateway/cluster timeouts and a temporarily
/// unavailable server.
pub fn is_retryable(err: &DumpError) -> bool {
    match err {
        DumpError::Transport { kind, .. } => matches!(
            kind,
            TransportKind::CouldNotConnect | TransportKind::WriteError | TransportKind::ReadError
        ),
        DumpError::Api { num, .. } => {
            matches!(*num, 503 | 504 | ERROR_CLUSTER_TIMEOUT)
        }
        _ => false,
    }
}

/// Failures where the server end is plainly absent or overloaded get a short
/// grace period before the next attempt.
fn needs_backoff(err: &DumpError) -> bool {
    matches!(
        err,
        DumpError::Transport {
            kind: TransportKind::CouldNotConnect,
            ..
        } | DumpError::Api { num: 503, .. }
    )
}

/// Run `f` until it succeeds, a non-retryable error occurs, or the attempt
/// budget is used up.
pub fn with_retry<T>(op_name: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last_err;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {attempt}/{MAX_ATTEMPTS}), retrying: {e}"
                );
                if needs_backoff(&e) {
                    std::thread::sleep(Duration::from_millis(500));
                }
                last_err = e;
            }
            Err(e) if is_retryable(&e) => {
                tracing::error!("{op_name}: too many network errors");
                last_err = e;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Err(DumpError::RetriesExhausted(format!("{op_name}: {last_err}")))
}

/// The historical behavior on an exhausted retry budget is to end the whole
/// process from inside the worker thread. That is only done when explicitly
/// requested; the default is to let the failure propagate as a job error.
pub fn maybe_abort(options: &Options, err: &DumpError) {
    if options.abort_on_retry_exhaustion {
        if let DumpError::RetriesExhausted(msg) = err {
            tracing::error!("unrecoverable network/http error: {msg}");
            std::process::exit(1);
        }
    }
}
