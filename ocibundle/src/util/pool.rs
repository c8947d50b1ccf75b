use crate::error::Result;
use std::{
    collections::VecDeque,
    sync::Mutex,
    thread,
};

/// Run `work` over every item with a bounded number of workers.
///
/// The first error stops the pool from picking up further items;
/// in-flight items finish and the error is returned. Item order of
/// execution is unspecified.
pub fn each_parallel<T, F>(items: Vec<T>, workers: usize, work: F) -> Result<()>
where
    T: Send,
    F: Fn(T) -> Result<()> + Sync,
{
    if workers <= 1 || items.len() <= 1 {
        for item in items {
            work(item)?;
        }
        return Ok(());
    }

    let workers = workers.min(items.len());
    let queue = Mutex::new(VecDeque::from(items));
    let failure = Mutex::new(None);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failure.lock().unwrap().is_some() {
                    break;
                }
                let item = match queue.lock().unwrap().pop_front() {
                    Some(item) => item,
                    None => break,
                };
                if let Err(err) = work(item) {
                    let mut failure = failure.lock().unwrap();
                    // First error wins
                    if failure.is_none() {
                        *failure = Some(err);
                    }
                    break;
                }
            });
        }
    });

    match failure.into_inner().unwrap() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_everything() {
        let count = AtomicUsize::new(0);
        each_parallel((0..100).collect(), 8, |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn single_worker_is_sequential() {
        let mut seen = Vec::new();
        let seen_ref = Mutex::new(&mut seen);
        each_parallel(vec![1, 2, 3], 1, |n| {
            seen_ref.lock().unwrap().push(n);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn error_stops_new_work() {
        let count = AtomicUsize::new(0);
        let result = each_parallel((0..100).collect(), 2, |n: usize| {
            count.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(Error::Network("boom".into()))
            } else {
                thread::sleep(std::time::Duration::from_millis(5));
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::Network(_))));
        assert!(count.load(Ordering::SeqCst) < 100);
    }
}
