//! Cancellable pulse trains on a single pump output.
//!
//! Each `RunningPump` owns one thread that toggles its output high for the
//! on phase and low for the off phase, `pulses` times. `stop()` zeroes the
//! remaining count and raises a cancel flag; the thread notices it at the
//! next loop check or during the (interruptible) off phase, so the output is
//! always left low.
//!
//! A new train may be told to start `after` earlier trains on the same
//! output. It joins them first, which keeps old and new writes to the same
//! pin from interleaving on the bus. A train counts as exited only after its
//! `on_done` has run.
use crate::protocol::CommandChannel;
use crate::util::off_duration_ms;
use fluidics_traits::Clock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Pulse count and phase durations of one train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulsePlan {
    pub pulses: u32,
    pub on: Duration,
    pub off: Duration,
}

impl PulsePlan {
    pub fn new(pulses: u32, period_s: f64, on_ms: u64, min_off_ms: u64) -> Self {
        Self {
            pulses,
            on: Duration::from_millis(on_ms),
            off: Duration::from_millis(off_duration_ms(period_s, on_ms, min_off_ms)),
        }
    }
}

/// How a pulse train ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Completed,
    Stopped,
    Failed,
}

type DoneFn = Box<dyn FnOnce(PumpOutcome) + Send>;

struct PumpShared {
    label: String,
    address: u8,
    pin: u8,
    plan: PulsePlan,
    remaining: AtomicU32,
    cancelled: AtomicBool,
    exited: Mutex<bool>,
    exit_cv: Condvar,
    on_done: Mutex<Option<DoneFn>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PumpShared {
    /// Fires the completion callback at most once.
    fn fire_done(&self, outcome: PumpOutcome) {
        let cb = self.on_done.lock().ok().and_then(|mut g| g.take());
        if let Some(cb) = cb {
            cb(outcome);
        }
    }

    fn mark_exited(&self) {
        *self.exited.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.exit_cv.notify_all();
    }

    fn take_pulse(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Handle to a running (or finished) pulse train. Cheap to clone.
#[derive(Clone)]
pub struct RunningPump {
    inner: Arc<PumpShared>,
}

impl fmt::Debug for RunningPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningPump")
            .field("label", &self.inner.label)
            .field("address", &self.inner.address)
            .field("pin", &self.inner.pin)
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl RunningPump {
    /// Spawn the pulse thread. `on_done` runs exactly once, from whichever
    /// of `stop()` or the thread gets there first.
    pub fn start<C, F>(
        label: impl Into<String>,
        ch: CommandChannel,
        pin: u8,
        plan: PulsePlan,
        clock: C,
        after: Vec<RunningPump>,
        on_done: F,
    ) -> Self
    where
        C: Clock + Send + 'static,
        F: FnOnce(PumpOutcome) + Send + 'static,
    {
        let shared = Arc::new(PumpShared {
            label: label.into(),
            address: ch.address(),
            pin,
            plan,
            remaining: AtomicU32::new(plan.pulses),
            cancelled: AtomicBool::new(false),
            exited: Mutex::new(false),
            exit_cv: Condvar::new(),
            on_done: Mutex::new(Some(Box::new(on_done))),
            thread: Mutex::new(None),
        });

        let worker = shared.clone();
        let handle = std::thread::spawn(move || {
            let exit = ExitGuard(&worker);
            for prev in &after {
                prev.join();
            }
            drop(after);
            let outcome = run_train(&worker, &ch, &clock);
            tracing::debug!(
                label = %worker.label,
                address = worker.address,
                pin = worker.pin,
                ?outcome,
                "pulse train finished"
            );
            // Callback before the exit flag: successors must not see this
            // train finished until its completion has been reported.
            worker.fire_done(outcome);
            drop(exit);
        });
        if let Ok(mut slot) = shared.thread.lock() {
            *slot = Some(handle);
        }
        Self { inner: shared }
    }

    /// Cancel the remaining pulses and fire `on_done` now. The thread drives
    /// the output low before it exits. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.remaining.store(0, Ordering::Release);
        self.inner.cancelled.store(true, Ordering::Release);
        tracing::debug!(label = %self.inner.label, pin = self.inner.pin, "pump stop requested");
        self.inner.fire_done(PumpOutcome::Stopped);
    }

    /// Block until the pulse thread has exited. Any number of callers may
    /// wait; the first one also reaps the thread.
    pub fn join(&self) {
        let handle = self.inner.thread.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.join() {
                tracing::warn!(?e, label = %self.inner.label, "pump thread panicked");
            }
            return;
        }
        let mut exited = self.inner.exited.lock().unwrap_or_else(PoisonError::into_inner);
        while !*exited {
            exited = self
                .inner
                .exit_cv
                .wait(exited)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn address(&self) -> u8 {
        self.inner.address
    }

    pub fn pin(&self) -> u8 {
        self.inner.pin
    }

    pub fn plan(&self) -> PulsePlan {
        self.inner.plan
    }

    pub fn remaining(&self) -> u32 {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// `true` once the pulse thread has stopped touching its output.
    pub fn is_finished(&self) -> bool {
        *self.inner.exited.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the train exited even if the thread unwinds.
struct ExitGuard<'a>(&'a PumpShared);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

fn run_train<C: Clock>(p: &PumpShared, ch: &CommandChannel, clock: &C) -> PumpOutcome {
    loop {
        if p.cancelled.load(Ordering::Acquire) {
            return PumpOutcome::Stopped;
        }
        if !p.take_pulse() {
            return if p.cancelled.load(Ordering::Acquire) {
                PumpOutcome::Stopped
            } else {
                PumpOutcome::Completed
            };
        }

        if let Err(e) = ch.digital_write(p.pin, true) {
            tracing::error!(label = %p.label, address = p.address, pin = p.pin, error = %e, "pump on failed");
            // Best effort; the output state is unknown after a failed write.
            let _ = ch.digital_write(p.pin, false);
            p.remaining.store(0, Ordering::Release);
            return PumpOutcome::Failed;
        }
        clock.sleep(p.plan.on);
        if let Err(e) = ch.digital_write(p.pin, false) {
            tracing::error!(label = %p.label, address = p.address, pin = p.pin, error = %e, "pump off failed");
            p.remaining.store(0, Ordering::Release);
            return PumpOutcome::Failed;
        }
        if clock.sleep_unless(p.plan.off, &p.cancelled) {
            return PumpOutcome::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SharedBus;
    use fluidics_hardware::SimulatedBus;
    use fluidics_traits::MonotonicClock;
    use fluidics_traits::clock::test_clock::TestClock;
    use std::sync::mpsc;

    fn channel(sim: &SimulatedBus, address: u8) -> CommandChannel {
        SharedBus::new(sim.clone())
            .channel(address)
            .with_settle(Duration::ZERO)
    }

    #[test]
    fn plan_derives_off_phase_from_period() {
        let plan = PulsePlan::new(20, 0.5, 50, 150);
        assert_eq!(plan.on, Duration::from_millis(50));
        assert_eq!(plan.off, Duration::from_millis(450));
    }

    #[test]
    fn n_pulses_make_n_high_and_n_low_writes() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let (tx, rx) = mpsc::channel();
        let pump = RunningPump::start(
            "t",
            channel(&sim, 17),
            6,
            PulsePlan::new(5, 0.2, 50, 150),
            TestClock::new(),
            Vec::new(),
            move |o| tx.send(o).unwrap(),
        );
        pump.join();
        assert_eq!(rx.recv().unwrap(), PumpOutcome::Completed);
        let ev = sim.pin_events(17, 6);
        assert_eq!(ev.len(), 10);
        assert!(ev.iter().step_by(2).all(|e| e.high));
        assert!(ev.iter().skip(1).step_by(2).all(|e| !e.high));
        assert_eq!(pump.remaining(), 0);
        assert!(pump.is_finished());
    }

    #[test]
    fn clock_advances_by_on_plus_off_per_pulse() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let clock = TestClock::new();
        let pump = RunningPump::start(
            "t",
            channel(&sim, 17),
            4,
            PulsePlan::new(3, 0.5, 50, 150),
            clock.clone(),
            Vec::new(),
            |_| {},
        );
        pump.join();
        assert_eq!(clock.elapsed(), Duration::from_millis(3 * 500));
    }

    #[test]
    fn stop_fires_done_once_and_leaves_pin_low() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let (tx, rx) = mpsc::channel();
        let pump = RunningPump::start(
            "t",
            channel(&sim, 17),
            5,
            PulsePlan::new(1000, 1.0, 50, 150),
            MonotonicClock::new(),
            Vec::new(),
            move |o| tx.send(o).unwrap(),
        );
        std::thread::sleep(Duration::from_millis(120));
        pump.stop();
        assert_eq!(rx.recv().unwrap(), PumpOutcome::Stopped);
        pump.stop();
        pump.join();
        assert!(rx.try_recv().is_err());
        assert_eq!(pump.remaining(), 0);
        assert_eq!(sim.level(17, 5), Some(false));
        let ev = sim.pin_events(17, 5);
        assert!(ev.len() < 10);
        assert!(!ev.last().unwrap().high);
    }

    #[test]
    fn write_failure_aborts_and_reports() {
        // No board at 19: the first write is not acknowledged.
        let sim = SimulatedBus::with_motor_boards([17]);
        let (tx, rx) = mpsc::channel();
        let pump = RunningPump::start(
            "t",
            channel(&sim, 19),
            4,
            PulsePlan::new(10, 0.2, 50, 150),
            TestClock::new(),
            Vec::new(),
            move |o| tx.send(o).unwrap(),
        );
        pump.join();
        assert_eq!(rx.recv().unwrap(), PumpOutcome::Failed);
        assert_eq!(pump.remaining(), 0);
    }

    #[test]
    fn successor_waits_for_predecessor_to_exit() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let ch = channel(&sim, 17);
        let first = RunningPump::start(
            "t",
            ch.clone(),
            6,
            PulsePlan::new(1000, 1.0, 50, 150),
            MonotonicClock::new(),
            Vec::new(),
            |_| {},
        );
        std::thread::sleep(Duration::from_millis(20));
        first.stop();
        let second = RunningPump::start(
            "t",
            ch,
            6,
            PulsePlan::new(2, 0.2, 50, 150),
            TestClock::new(),
            vec![first.clone()],
            |_| {},
        );
        second.join();
        assert!(first.is_finished());
        let ev = sim.pin_events(17, 6);
        // Strict high/low alternation: the old train's final low precedes the new train.
        for pair in ev.chunks(2) {
            assert!(pair[0].high);
            assert!(!pair[1].high);
        }
        assert_eq!(sim.level(17, 6), Some(false));
    }

    #[test]
    fn predecessor_completion_is_reported_before_successors_pulse() {
        let sim = SimulatedBus::with_motor_boards([17]);
        let ch = channel(&sim, 17);
        let done_at = Arc::new(Mutex::new(None));
        let first = {
            let done_at = Arc::clone(&done_at);
            RunningPump::start(
                "t",
                ch.clone(),
                6,
                PulsePlan::new(2, 0.05, 20, 20),
                MonotonicClock::new(),
                Vec::new(),
                move |o| {
                    // Slow callback: widens the window a successor could slip through.
                    std::thread::sleep(Duration::from_millis(40));
                    *done_at.lock().unwrap() = Some((o, std::time::Instant::now()));
                },
            )
        };
        // Two successors: one reaps the thread, the other waits on the exit flag.
        let successors: Vec<_> = [4, 5]
            .into_iter()
            .map(|pin| {
                RunningPump::start(
                    "t",
                    ch.clone(),
                    pin,
                    PulsePlan::new(1, 0.05, 20, 20),
                    TestClock::new(),
                    vec![first.clone()],
                    |_| {},
                )
            })
            .collect();
        for s in &successors {
            s.join();
        }

        let recorded = *done_at.lock().unwrap();
        let (outcome, done) = recorded.expect("first train reported");
        assert_eq!(outcome, PumpOutcome::Completed);
        assert_eq!(sim.pin_events(17, 6).len(), 4);
        for pin in [4, 5] {
            let ev = sim.pin_events(17, pin);
            assert_eq!(ev.len(), 2);
            assert!(ev[0].high);
            assert!(ev[0].at >= done, "pin {pin} pulsed before the predecessor reported");
        }
    }
}
