//! A cancellable, re-armable one-shot timer.
//!
//! Unlike a plain [`tokio::time::Sleep`], a [`Deadline`] can be re-armed and
//! stopped from other tasks while a consumer is parked on [`Deadline::wait`]
//! inside a `select!` loop. `reset` replaces any previously armed firing;
//! `stop` leaves the deadline un-armed so it never fires.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

#[derive(Debug, Default)]
struct State {
    deadline: Option<Instant>,
    /// Bumped on every mutation so an in-flight `wait` can tell a stale
    /// firing from a current one.
    generation: u64,
}

#[derive(Debug, Default)]
pub struct Deadline {
    state: Mutex<State>,
    notify: Notify,
}

impl Deadline {
    /// Creates an un-armed deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the deadline `after` from now, cancelling any prior firing.
    pub fn reset(&self, after: Duration) {
        self.reset_at(Instant::now() + after);
    }

    /// Arms the deadline at `at`, cancelling any prior firing.
    pub fn reset_at(&self, at: Instant) {
        let mut s = self.state.lock().unwrap();
        s.deadline = Some(at);
        s.generation += 1;
        self.notify.notify_waiters();
    }

    /// Arms the deadline at `at` unless it is already armed earlier: an
    /// urgent deadline can shorten the wait, a lazy one cannot lengthen it.
    pub fn arm_earliest(&self, at: Instant) {
        let mut s = self.state.lock().unwrap();
        match s.deadline {
            Some(current) if current <= at => {}
            _ => {
                s.deadline = Some(at);
                s.generation += 1;
                self.notify.notify_waiters();
            }
        }
    }

    /// Disarms the deadline. Idempotent; a stopped deadline never fires.
    pub fn stop(&self) {
        let mut s = self.state.lock().unwrap();
        s.deadline = None;
        s.generation += 1;
        self.notify.notify_waiters();
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().deadline.is_some()
    }

    /// Completes when the armed deadline expires. Waits forever while
    /// un-armed. Cancel-safe: dropping the future consumes nothing.
    pub async fn wait(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // Register before reading the state so a concurrent mutation
            // cannot slip between the read and the await.
            notified.as_mut().enable();

            let (target, generation) = {
                let s = self.state.lock().unwrap();
                (s.deadline, s.generation)
            };

            match target {
                None => notified.await,
                Some(at) => {
                    tokio::select! {
                        _ = time::sleep_until(at) => {
                            let mut s = self.state.lock().unwrap();
                            if s.generation == generation {
                                s.deadline = None;
                                s.generation += 1;
                                return;
                            }
                        }
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }
}
