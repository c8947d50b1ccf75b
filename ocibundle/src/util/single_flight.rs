use crate::error::{Error, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};

enum FlightState {
    Running,
    Done(std::result::Result<(), String>),
}

struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

/// At-most-once execution per key.
///
/// The copier keys this by `(host, repo, digest)` so two workers
/// never upload the same destination blob simultaneously. The first
/// caller for a key runs the closure; concurrent callers block until
/// it completes. A successful flight stays recorded, so later callers
/// skip the upload entirely; a failed flight is forgotten and the
/// next caller retries.
pub struct SingleFlight {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        SingleFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn run(&self, key: &str, work: impl FnOnce() -> Result<()>) -> Result<()> {
        let (flight, leader) = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        state: Mutex::new(FlightState::Running),
                        done: Condvar::new(),
                    });
                    flights.insert(key.to_string(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if leader {
            let result = work();
            let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
            *flight.state.lock().unwrap() = FlightState::Done(outcome);
            flight.done.notify_all();
            if result.is_err() {
                self.flights.lock().unwrap().remove(key);
            }
            result
        } else {
            let mut state = flight.state.lock().unwrap();
            while matches!(*state, FlightState::Running) {
                state = flight.done.wait(state).unwrap();
            }
            match &*state {
                FlightState::Done(Ok(())) => Ok(()),
                FlightState::Done(Err(reason)) => Err(Error::BlobUpload {
                    key: key.to_string(),
                    reason: reason.clone(),
                }),
                FlightState::Running => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[test]
    fn concurrent_callers_run_once() {
        let flights = SingleFlight::new();
        let runs = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    flights
                        .run("host|repo|sha256:abc", || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_keys_run_independently() {
        let flights = SingleFlight::new();
        let runs = AtomicUsize::new(0);
        flights
            .run("a", || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        flights
            .run("b", || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_are_retried_by_later_callers() {
        let flights = SingleFlight::new();
        let result = flights.run("key", || Err(Error::Network("boom".into())));
        assert!(result.is_err());

        // Failed flight is forgotten, the next caller runs again
        let result = flights.run("key", || Ok(()));
        assert!(result.is_ok());

        // Successful flight stays recorded
        let result = flights.run("key", || panic!("must not run again"));
        assert!(result.is_ok());
    }
}
