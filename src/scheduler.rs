//! Periodic, single-flight face verification.
//!
//! The render loop calls [`VerificationScheduler::maybe_dispatch`] once per
//! iteration. Every `interval` iterations, and only while no other check is
//! running, a snapshot of the frame is handed to a background thread that runs
//! the (slow) verifier. The latest result is kept so the loop can draw it on
//! every frame without waiting.

use std::num::NonZeroU64;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::VerificationError;

/// Takes an owned copy of a frame for use on another thread.
pub trait Snapshot: Sized {
    fn snapshot(&self) -> anyhow::Result<Self>;
}

/// Compares a frame against the reference face.
///
/// The reference is loaded by the implementation and never changes afterwards.
/// Calls may take arbitrarily long and are only ever made from the scheduler's
/// worker thread, one at a time.
pub trait Verifier: Send + 'static {
    type Frame: Snapshot + Send + 'static;

    fn verify(&mut self, frame: &Self::Frame) -> Result<bool, VerificationError>;
}

/// Most recent verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchStatus {
    /// No verification has finished yet.
    #[default]
    Unknown,
    NoMatch,
    Match,
}

impl MatchStatus {
    pub fn is_match(self) -> bool {
        self == MatchStatus::Match
    }
}

/// What [`VerificationScheduler::maybe_dispatch`] did with an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Launched,
    /// Iteration is not a multiple of the interval.
    NotEligible,
    /// A verification is already running.
    Busy,
    /// Snapshot or thread spawn failed, guard was released.
    LaunchFailed,
    /// Scheduler was shut down.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub completed: u64,
    /// Completed checks whose verifier errored or panicked.
    pub failed: u64,
    /// Eligible iterations skipped because a check was in flight.
    pub skipped_busy: u64,
}

#[derive(Debug, Default)]
struct VerificationState {
    status: MatchStatus,
    in_flight: bool,
    closed: bool,
    stats: SchedulerStats,
}

struct Shared {
    state: Mutex<VerificationState>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VerificationState> {
        // state is a handful of plain values, a panic cannot leave it torn
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        self.lock().in_flight = false;
        self.idle.notify_all();
    }

    fn finish(&self, outcome: Result<bool, VerificationError>) {
        let mut state = self.lock();
        state.stats.completed += 1;
        state.status = match outcome {
            Ok(true) => MatchStatus::Match,
            Ok(false) => MatchStatus::NoMatch,
            Err(error) => {
                state.stats.failed += 1;
                tracing::warn!(%error, "face verification failed");
                MatchStatus::NoMatch
            }
        };
        state.in_flight = false;
        drop(state);
        self.idle.notify_all();
    }
}

/// Completes a check when dropped, so the guard is released even if the
/// verifier panics.
struct Completion {
    shared: Arc<Shared>,
    outcome: Option<Result<bool, VerificationError>>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(VerificationError::Failed(
                "verifier panicked".to_string(),
            ))
        });
        self.shared.finish(outcome);
    }
}

/// True when `iteration` should trigger a verification attempt.
pub fn is_eligible(iteration: u64, interval: NonZeroU64) -> bool {
    iteration % interval.get() == 0
}

pub struct VerificationScheduler<V: Verifier> {
    interval: NonZeroU64,
    verifier: Arc<Mutex<V>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Verifier> VerificationScheduler<V> {
    pub fn new(verifier: V, interval: NonZeroU64) -> Self {
        Self {
            interval,
            verifier: Arc::new(Mutex::new(verifier)),
            shared: Arc::new(Shared {
                state: Mutex::new(VerificationState::default()),
                idle: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> NonZeroU64 {
        self.interval
    }

    pub fn status(&self) -> MatchStatus {
        self.shared.lock().status
    }

    pub fn in_flight(&self) -> bool {
        self.shared.lock().in_flight
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats
    }

    /// Start a verification of `frame` if this iteration is eligible and no
    /// other verification is running. Never blocks on the verifier.
    pub fn maybe_dispatch(&self, iteration: u64, frame: &V::Frame) -> Dispatch {
        if !is_eligible(iteration, self.interval) {
            return Dispatch::NotEligible;
        }

        {
            let mut state = self.shared.lock();
            if state.closed {
                return Dispatch::Closed;
            }
            if state.in_flight {
                state.stats.skipped_busy += 1;
                return Dispatch::Busy;
            }
            state.in_flight = true;
            state.stats.dispatched += 1;
        }

        let snapshot = match frame.snapshot() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(iteration, ?error, "failed to copy frame for verification");
                self.shared.release();
                return Dispatch::LaunchFailed;
            }
        };

        match self.launch(snapshot) {
            Ok(handle) => {
                tracing::debug!(iteration, "face verification dispatched");
                let previous = self
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(handle);
                // previous worker already cleared the guard but may still be
                // tearing down, only join it if that is done
                if let Some(previous) = previous.filter(|handle| handle.is_finished()) {
                    _ = previous.join();
                }
                Dispatch::Launched
            }
            Err(error) => {
                tracing::warn!(iteration, %error, "failed to start verification thread");
                self.shared.release();
                Dispatch::LaunchFailed
            }
        }
    }

    fn launch(&self, snapshot: V::Frame) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        let verifier = self.verifier.clone();
        thread::Builder::new()
            .name("face-verify".into())
            .spawn(move || {
                let mut completion = Completion {
                    shared,
                    outcome: None,
                };
                let started = Instant::now();
                let outcome = verifier
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .verify(&snapshot);
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    matched = matches!(outcome, Ok(true)),
                    "face verification finished"
                );
                completion.outcome = Some(outcome);
            })
    }

    /// Block until no verification is running or `timeout` passes.
    /// Returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |state| state.in_flight)
            .unwrap_or_else(PoisonError::into_inner);
        !state.in_flight
    }

    /// Refuse further dispatches and wait up to `grace` for a running check.
    /// A check still running after that is left to finish on its own.
    pub fn shutdown(&self, grace: Duration) {
        self.shared.lock().closed = true;

        let idle = self.wait_idle(grace);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match (idle, worker) {
            (true, Some(worker)) => {
                if worker.join().is_err() {
                    tracing::warn!("verification thread panicked");
                }
            }
            (false, Some(_)) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "verification still running at shutdown, detaching"
                );
            }
            (_, None) => {}
        }

        let stats = self.stats();
        tracing::info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            skipped_busy = stats.skipped_busy,
            "verification scheduler stopped"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::mpsc;

    pub(crate) const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TestFrame(pub u64);

    impl Snapshot for TestFrame {
        fn snapshot(&self) -> anyhow::Result<Self> {
            Ok(*self)
        }
    }

    /// Verifier that returns whatever the test sends it, one answer per call.
    /// Blocks until an answer arrives.
    pub(crate) struct GatedVerifier {
        answers: mpsc::Receiver<Result<bool, VerificationError>>,
        calls: mpsc::Sender<u64>,
    }

    pub(crate) struct Gate {
        pub answers: mpsc::Sender<Result<bool, VerificationError>>,
        pub calls: mpsc::Receiver<u64>,
    }

    pub(crate) fn gated() -> (GatedVerifier, Gate) {
        let (answer_tx, answer_rx) = mpsc::channel();
        let (call_tx, call_rx) = mpsc::channel();
        (
            GatedVerifier {
                answers: answer_rx,
                calls: call_tx,
            },
            Gate {
                answers: answer_tx,
                calls: call_rx,
            },
        )
    }

    impl Verifier for GatedVerifier {
        type Frame = TestFrame;

        fn verify(&mut self, frame: &TestFrame) -> Result<bool, VerificationError> {
            _ = self.calls.send(frame.0);
            self.answers
                .recv()
                .unwrap_or_else(|_| Err(VerificationError::Failed("gate closed".into())))
        }
    }

    struct PanickingVerifier;

    impl Verifier for PanickingVerifier {
        type Frame = TestFrame;

        fn verify(&mut self, _: &TestFrame) -> Result<bool, VerificationError> {
            panic!("model exploded");
        }
    }

    struct BrokenFrame;

    impl Snapshot for BrokenFrame {
        fn snapshot(&self) -> anyhow::Result<Self> {
            anyhow::bail!("out of memory")
        }
    }

    struct NeverCalled;

    impl Verifier for NeverCalled {
        type Frame = BrokenFrame;

        fn verify(&mut self, _: &BrokenFrame) -> Result<bool, VerificationError> {
            unreachable!("snapshot failed, nothing to verify")
        }
    }

    /// Frame whose copies take a long time to free, keeping the worker
    /// thread alive after the check itself finished.
    struct SlowToFree {
        copy: bool,
    }

    impl Snapshot for SlowToFree {
        fn snapshot(&self) -> anyhow::Result<Self> {
            Ok(SlowToFree { copy: true })
        }
    }

    impl Drop for SlowToFree {
        fn drop(&mut self) {
            if self.copy {
                thread::sleep(Duration::from_secs(2));
            }
        }
    }

    struct AlwaysMatch;

    impl Verifier for AlwaysMatch {
        type Frame = SlowToFree;

        fn verify(&mut self, _: &SlowToFree) -> Result<bool, VerificationError> {
            Ok(true)
        }
    }

    fn every(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    #[test]
    fn test_eligible_iterations() {
        let eligible: Vec<u64> = (0..60).filter(|i| is_eligible(*i, every(30))).collect();
        assert_eq!(eligible, vec![0, 30]);
    }

    #[test]
    fn test_not_eligible_iterations_never_dispatch() {
        let (verifier, _gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(30));
        for i in 1..30 {
            assert_eq!(scheduler.maybe_dispatch(i, &TestFrame(i)), Dispatch::NotEligible);
        }
        assert_eq!(scheduler.stats().dispatched, 0);
        assert!(!scheduler.in_flight());
    }

    #[test]
    fn test_single_flight() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));

        assert_eq!(scheduler.maybe_dispatch(0, &TestFrame(0)), Dispatch::Launched);
        assert_eq!(gate.calls.recv_timeout(WAIT).unwrap(), 0);

        for i in 1..10 {
            assert_eq!(scheduler.maybe_dispatch(i, &TestFrame(i)), Dispatch::Busy);
        }
        let stats = scheduler.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.skipped_busy, 9);
        assert!(gate.calls.try_recv().is_err());

        gate.answers.send(Ok(true)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
    }

    #[test]
    fn test_guard_set_before_task_runs() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));
        scheduler.maybe_dispatch(0, &TestFrame(0));
        // no answer yet, guard must already be visible
        assert!(scheduler.in_flight());
        gate.answers.send(Ok(false)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
    }

    #[test]
    fn test_error_resets_prior_match() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));

        scheduler.maybe_dispatch(0, &TestFrame(0));
        gate.answers.send(Ok(true)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(scheduler.status(), MatchStatus::Match);

        scheduler.maybe_dispatch(1, &TestFrame(1));
        gate.answers
            .send(Err(VerificationError::NoFaceDetected))
            .unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(scheduler.status(), MatchStatus::NoMatch);
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[test]
    fn test_guard_clears_after_success() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));

        scheduler.maybe_dispatch(0, &TestFrame(0));
        gate.answers.send(Ok(false)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert!(!scheduler.in_flight());
        assert_eq!(scheduler.status(), MatchStatus::NoMatch);

        assert_eq!(scheduler.maybe_dispatch(1, &TestFrame(1)), Dispatch::Launched);
        gate.answers.send(Ok(true)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
    }

    #[test]
    fn test_guard_clears_after_failure() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));

        scheduler.maybe_dispatch(0, &TestFrame(0));
        gate.answers
            .send(Err(VerificationError::Failed("boom".into())))
            .unwrap();
        assert!(scheduler.wait_idle(WAIT));

        assert_eq!(scheduler.maybe_dispatch(1, &TestFrame(1)), Dispatch::Launched);
        gate.answers.send(Ok(true)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(scheduler.status(), MatchStatus::Match);
    }

    #[test]
    fn test_panicking_verifier_degrades_to_no_match() {
        let scheduler = VerificationScheduler::new(PanickingVerifier, every(1));
        assert_eq!(scheduler.maybe_dispatch(0, &TestFrame(0)), Dispatch::Launched);
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(scheduler.status(), MatchStatus::NoMatch);
        assert_eq!(scheduler.stats().failed, 1);

        // poisoned verifier lock must not wedge later checks
        assert_eq!(scheduler.maybe_dispatch(1, &TestFrame(1)), Dispatch::Launched);
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(scheduler.stats().failed, 2);
    }

    #[test]
    fn test_dispatch_does_not_wait_for_previous_thread_exit() {
        let scheduler = VerificationScheduler::new(AlwaysMatch, every(1));
        let frame = SlowToFree { copy: false };

        assert_eq!(scheduler.maybe_dispatch(0, &frame), Dispatch::Launched);
        assert!(scheduler.wait_idle(WAIT));

        // first thread is still freeing its copy
        let started = Instant::now();
        assert_eq!(scheduler.maybe_dispatch(1, &frame), Dispatch::Launched);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(scheduler.wait_idle(WAIT));
    }

    #[test]
    fn test_snapshot_failure_releases_guard() {
        let scheduler = VerificationScheduler::new(NeverCalled, every(1));
        assert_eq!(scheduler.maybe_dispatch(0, &BrokenFrame), Dispatch::LaunchFailed);
        assert!(!scheduler.in_flight());
        assert_eq!(scheduler.status(), MatchStatus::Unknown);
        assert_eq!(scheduler.maybe_dispatch(1, &BrokenFrame), Dispatch::LaunchFailed);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(30));

        assert_eq!(scheduler.maybe_dispatch(0, &TestFrame(0)), Dispatch::Launched);
        assert_eq!(gate.calls.recv_timeout(WAIT).unwrap(), 0);

        for i in 1..30 {
            if i == 15 {
                gate.answers.send(Ok(true)).unwrap();
                assert!(scheduler.wait_idle(WAIT));
                assert_eq!(scheduler.status(), MatchStatus::Match);
            }
            assert_eq!(scheduler.maybe_dispatch(i, &TestFrame(i)), Dispatch::NotEligible);
        }

        assert_eq!(scheduler.maybe_dispatch(30, &TestFrame(30)), Dispatch::Launched);
        assert_eq!(gate.calls.recv_timeout(WAIT).unwrap(), 30);
        for i in 31..45 {
            scheduler.maybe_dispatch(i, &TestFrame(i));
            // stale result from the first check until the second finishes
            assert_eq!(scheduler.status(), MatchStatus::Match);
        }

        gate.answers.send(Ok(false)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(scheduler.status(), MatchStatus::NoMatch);
        assert_eq!(scheduler.stats().dispatched, 2);
    }

    #[test]
    fn test_shutdown_refuses_new_checks() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));
        scheduler.maybe_dispatch(0, &TestFrame(0));
        gate.answers.send(Ok(true)).unwrap();

        scheduler.shutdown(WAIT);
        assert!(!scheduler.in_flight());
        assert_eq!(scheduler.maybe_dispatch(1, &TestFrame(1)), Dispatch::Closed);
    }

    #[test]
    fn test_shutdown_detaches_stuck_check() {
        let (verifier, gate) = gated();
        let scheduler = VerificationScheduler::new(verifier, every(1));
        scheduler.maybe_dispatch(0, &TestFrame(0));

        scheduler.shutdown(Duration::from_millis(20));
        assert!(scheduler.in_flight());

        gate.answers.send(Ok(true)).unwrap();
        assert!(scheduler.wait_idle(WAIT));
    }
}
