//! Hour-long alternating mix program.
//!
//! While running, every tick looks at the time since start. At
//! `forward_minute` of each hour the forward step is applied if the program
//! is on branch A (and the branch flips to B); at `reverse_minute` the
//! reverse step is applied if on branch B (flipping back to A). The branch
//! makes each boundary fire once even though many ticks land in the same
//! minute. After `total_hours` the program stops itself.
use crate::config::ProgramPlan;
use crate::error::FluidicsError;
use crate::util::format_hms;
use crate::valve::Branch;
use crossbeam_channel as xch;
use fluidics_traits::Clock;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Something that can apply a step by label.
pub trait StepRunner {
    fn run_step(&self, label: &str) -> Result<(), FluidicsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramState {
    pub running: bool,
    pub started_at: Option<Instant>,
    pub branch: Branch,
}

impl Default for ProgramState {
    fn default() -> Self {
        Self {
            running: false,
            started_at: None,
            branch: Branch::A,
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Waiting,
    Applied { label: String, now_on: Branch },
    /// The step could not be applied; the schedule moves on regardless.
    Failed { label: String, now_on: Branch, error: String },
    Finished,
}

#[derive(Debug)]
pub struct TimedProgram<C: Clock> {
    plan: ProgramPlan,
    state: ProgramState,
    clock: C,
}

impl<C: Clock> TimedProgram<C> {
    pub fn new(plan: ProgramPlan, clock: C) -> Self {
        Self {
            plan,
            state: ProgramState::default(),
            clock,
        }
    }

    pub fn plan(&self) -> &ProgramPlan {
        &self.plan
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Start from branch A at time zero. No-op when already running.
    pub fn start(&mut self) {
        if self.state.running {
            return;
        }
        self.state = ProgramState {
            running: true,
            started_at: Some(self.clock.now()),
            branch: Branch::A,
        };
        tracing::info!(
            forward = %self.plan.forward_step,
            reverse = %self.plan.reverse_step,
            hours = self.plan.total_hours,
            "program started"
        );
    }

    pub fn stop(&mut self) {
        if self.state.running {
            tracing::info!(elapsed = ?self.elapsed_text(), "program stopped");
        }
        self.state.running = false;
        self.state.started_at = None;
    }

    /// Flip between running and stopped; returns the new running flag.
    pub fn toggle(&mut self) -> bool {
        if self.state.running {
            self.stop();
        } else {
            self.start();
        }
        self.state.running
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.state.started_at?;
        self.state
            .running
            .then(|| self.clock.now().saturating_duration_since(started))
    }

    /// `HH:MM:SS` since start, `None` when stopped.
    pub fn elapsed_text(&self) -> Option<String> {
        self.elapsed().map(format_hms)
    }

    pub fn tick<R: StepRunner + ?Sized>(&mut self, runner: &R) -> TickOutcome {
        let Some(elapsed) = self.elapsed() else {
            return TickOutcome::Idle;
        };
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let minute = (secs / 60) % 60;

        if hours >= self.plan.total_hours {
            self.stop();
            tracing::info!(hours, "program finished");
            return TickOutcome::Finished;
        }

        let label = match self.state.branch {
            Branch::A if minute == self.plan.forward_minute => self.plan.forward_step.clone(),
            Branch::B if minute == self.plan.reverse_minute => self.plan.reverse_step.clone(),
            _ => return TickOutcome::Waiting,
        };
        self.state.branch = self.state.branch.other();
        let now_on = self.state.branch;
        match runner.run_step(&label) {
            Ok(()) => {
                tracing::info!(%label, hours, minute, %now_on, "program step applied");
                TickOutcome::Applied { label, now_on }
            }
            Err(e) => {
                tracing::error!(%label, hours, minute, error = %e, "program step failed");
                TickOutcome::Failed {
                    label,
                    now_on,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Ticks a shared `TimedProgram` on a background thread.
///
/// The thread exits when the runner is dropped or `shutdown` is called.
pub struct ProgramRunner {
    shutdown: Option<xch::Sender<()>>,
    finished: xch::Receiver<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl ProgramRunner {
    pub fn spawn<C, R>(program: Arc<Mutex<TimedProgram<C>>>, runner: Arc<R>, every: Duration) -> Self
    where
        C: Clock + Send + 'static,
        R: StepRunner + Send + Sync + ?Sized + 'static,
    {
        let (shutdown_tx, shutdown_rx) = xch::bounded::<()>(0);
        let (finished_tx, finished_rx) = xch::bounded::<()>(1);
        let ticker = xch::tick(every);

        let join_handle = std::thread::spawn(move || {
            // First tick right away so a minute-0 step is not delayed a period.
            let mut first = true;
            loop {
                if !first {
                    xch::select! {
                        recv(ticker) -> _ => {}
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                first = false;
                let outcome = program
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .tick(runner.as_ref());
                tracing::trace!(?outcome, "program tick");
                if outcome == TickOutcome::Finished {
                    let _ = finished_tx.try_send(());
                }
            }
            tracing::trace!("program runner exiting cleanly");
        });

        Self {
            shutdown: Some(shutdown_tx),
            finished: finished_rx,
            join_handle: Some(join_handle),
        }
    }

    /// Wait up to `timeout` for the program to finish on its own.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.finished.recv_timeout(timeout).is_ok()
    }

    pub fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel and wakes the select.
        self.shutdown.take();
        if let Some(handle) = self.join_handle.take()
            && let Err(e) = handle.join()
        {
            tracing::warn!(?e, "program runner panicked during shutdown");
        }
    }
}

impl Drop for ProgramRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluidics_traits::MonotonicClock;
    use fluidics_traits::clock::test_clock::TestClock;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl StepRunner for Recorder {
        fn run_step(&self, label: &str) -> Result<(), FluidicsError> {
            self.calls.lock().unwrap().push(label.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl StepRunner for Failing {
        fn run_step(&self, label: &str) -> Result<(), FluidicsError> {
            Err(FluidicsError::UnknownStep(label.to_string()))
        }
    }

    #[test]
    fn idle_program_does_nothing() {
        let mut p = TimedProgram::new(ProgramPlan::default(), TestClock::new());
        let rec = Recorder::default();
        assert_eq!(p.tick(&rec), TickOutcome::Idle);
        assert!(p.elapsed_text().is_none());
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn each_boundary_fires_once() {
        let clock = TestClock::new();
        let mut p = TimedProgram::new(ProgramPlan::default(), clock.clone());
        let rec = Recorder::default();
        p.start();
        assert!(matches!(p.tick(&rec), TickOutcome::Applied { .. }));
        for _ in 0..59 {
            clock.advance(Duration::from_secs(1));
            assert_eq!(p.tick(&rec), TickOutcome::Waiting);
        }
        assert_eq!(p.state().branch, Branch::B);
        assert_eq!(rec.calls.lock().unwrap().as_slice(), ["A -> B"]);
    }

    #[test]
    fn failed_step_still_advances_branch() {
        let mut p = TimedProgram::new(ProgramPlan::default(), TestClock::new());
        p.start();
        match p.tick(&Failing) {
            TickOutcome::Failed { label, now_on, .. } => {
                assert_eq!(label, "A -> B");
                assert_eq!(now_on, Branch::B);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.is_running());
    }

    #[test]
    fn toggle_and_elapsed_text() {
        let clock = TestClock::new();
        let mut p = TimedProgram::new(ProgramPlan::default(), clock.clone());
        assert!(p.toggle());
        clock.advance(Duration::from_secs(3725));
        assert_eq!(p.elapsed_text().as_deref(), Some("01:02:05"));
        assert!(!p.toggle());
        assert_eq!(p.elapsed_text(), None);
    }

    #[test]
    fn runner_ticks_immediately_and_shuts_down() {
        let program = Arc::new(Mutex::new(TimedProgram::new(
            ProgramPlan::default(),
            MonotonicClock::new(),
        )));
        program.lock().unwrap().start();
        let rec = Arc::new(Recorder::default());
        let mut runner = ProgramRunner::spawn(program.clone(), rec.clone(), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        runner.shutdown();
        assert_eq!(rec.calls.lock().unwrap().as_slice(), ["A -> B"]);
        assert_eq!(program.lock().unwrap().state().branch, Branch::B);
    }

    #[test]
    fn runner_reports_finish() {
        let clock = TestClock::new();
        let program = Arc::new(Mutex::new(TimedProgram::new(
            ProgramPlan {
                total_hours: 1,
                ..ProgramPlan::default()
            },
            clock.clone(),
        )));
        program.lock().unwrap().start();
        clock.advance(Duration::from_secs(3600));
        let runner = ProgramRunner::spawn(program.clone(), Arc::new(Recorder::default()), Duration::from_millis(5));
        assert!(runner.wait_finished(Duration::from_secs(2)));
        assert!(!program.lock().unwrap().is_running());
    }
}
