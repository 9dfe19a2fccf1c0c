use std::io;
use std::thread;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 8;

const INITIAL_DELAY: Duration = Duration::from_micros(50);

const MAX_DELAY: Duration = Duration::from_millis(20);

/// Errors caused by momentary resource exhaustion. Anything else is reported
/// to the caller right away.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN | libc::EINTR | libc::EMFILE | libc::ENFILE | libc::ENOMEM)
    ) || err.kind() == io::ErrorKind::WouldBlock
}

/// Retries `op` with exponential backoff while it fails with a transient
/// error. Resource exhaustion is never surfaced to users of the runtime
/// unless it persists across every attempt.
pub(crate) fn retry_with_backoff<T, F>(what: &'static str, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                tracing::debug!(what, attempt, error = %e, "transient failure, backing off");
                thread::sleep(delay);
                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
