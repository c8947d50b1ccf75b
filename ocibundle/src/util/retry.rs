use crate::error::{Error, Result};
use std::{thread, time::Duration};

const ATTEMPTS: usize = 5;
const DELAY: Duration = Duration::from_secs(1);

/// Run a network operation up to five times with a fixed delay
/// between attempts.
///
/// Non-retryable errors (see [Error::is_retryable]) short-circuit the
/// loop and surface unchanged.
pub fn retry<T>(mut do_fn: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last_err = None;
    for attempt in 0..ATTEMPTS {
        match do_fn() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                log::debug!("Attempt {} failed: {}", attempt + 1, err);
                last_err = Some(err);
            }
        }
        if attempt + 1 < ATTEMPTS {
            thread::sleep(DELAY);
        }
    }
    Err(Error::RetriesExhausted(Box::new(
        last_err.expect("at least one attempt ran"),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_retryable_short_circuits() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Unauthorized("reg.example".into()))
        });
        assert!(matches!(result, Err(Error::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tar_entry_not_found_short_circuits() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::TarEntryNotFound("sha256-abc".into()))
        });
        assert!(matches!(result, Err(Error::TarEntryNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retryable_errors_recover() {
        let calls = AtomicUsize::new(0);
        let result = retry(|| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Network("connection reset".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
