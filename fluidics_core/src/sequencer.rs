//! Applies named steps and tracks which ones are still pumping.
//!
//! The registry maps a step label to the pulse trains of its latest run.
//! Every run gets a fresh id; a completion callback only removes the entry
//! if it still belongs to its own run, so a late callback from a replaced
//! run never deregisters its successor.
//!
//! One output carries at most one pulse train: applying a step first stops
//! its own previous run and every run of another label that pumps on one of
//! the same `(address, pin)` outputs.
//!
//! `stop()` on a pump fires its callback synchronously and that callback
//! takes the registry lock, so `stop()` is never called while the registry
//! lock is held.
//!
//! Stopped trains leave the registry at once but keep running until their
//! output is low; they wait in `draining` so `shutdown()` can join them.
use crate::config::{BusTiming, PumpDefaults};
use crate::error::FluidicsError;
use crate::mocks::NoopSwitches;
use crate::program::StepRunner;
use crate::protocol::{CommandChannel, SharedBus};
use crate::pump::{PulsePlan, PumpOutcome, RunningPump};
use crate::status::{PumpStatus, StepStatus};
use crate::step::{StepBook, StepDescriptor};
use crate::valve::set_valve;
use fluidics_traits::{Clock, MonotonicClock, SwitchBank};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-call overrides of a step's pulse count and period.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ApplyOverrides {
    pub pulses: Option<u32>,
    pub period_s: Option<f64>,
}

/// What `apply` did.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub label: String,
    pub run_id: Option<u64>,
    pub valves_set: usize,
    pub switches_set: usize,
    pub pumps_started: usize,
    /// A previous run of the same label was stopped first.
    pub restarted: bool,
    /// Other labels stopped because they were pumping on one of this step's
    /// outputs.
    pub preempted: Vec<String>,
    pub plan: Option<PulsePlan>,
}

#[derive(Debug, Clone)]
struct RunningStep {
    run_id: u64,
    pumps: Vec<RunningPump>,
}

impl RunningStep {
    fn stop_all(&self) {
        for p in &self.pumps {
            p.stop();
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, RunningStep>>>;

fn lock_registry(r: &Registry) -> MutexGuard<'_, HashMap<String, RunningStep>> {
    r.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Sequencer<C = MonotonicClock>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    bus: SharedBus,
    timing: BusTiming,
    defaults: PumpDefaults,
    steps: StepBook,
    clock: C,
    switches: Mutex<Box<dyn SwitchBank + Send>>,
    registry: Registry,
    draining: Mutex<Vec<RunningPump>>,
    apply_lock: Mutex<()>,
    next_run: AtomicU64,
}

impl<C> Sequencer<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub fn new(bus: SharedBus, steps: StepBook, clock: C) -> Self {
        Self {
            bus,
            timing: BusTiming::default(),
            defaults: PumpDefaults::default(),
            steps,
            clock,
            switches: Mutex::new(Box::new(NoopSwitches)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            draining: Mutex::new(Vec::new()),
            apply_lock: Mutex::new(()),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn with_defaults(mut self, defaults: PumpDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_timing(mut self, timing: BusTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_switches<S: SwitchBank + Send + 'static>(mut self, switches: S) -> Self {
        self.switches = Mutex::new(Box::new(switches));
        self
    }

    pub fn steps(&self) -> &StepBook {
        &self.steps
    }

    pub fn defaults(&self) -> &PumpDefaults {
        &self.defaults
    }

    fn channel(&self, address: u8) -> CommandChannel {
        self.bus.channel(address).with_settle(self.timing.settle)
    }

    /// Look up `label` in the step book and apply it.
    pub fn apply_label(
        &self,
        label: &str,
        overrides: ApplyOverrides,
    ) -> Result<ApplyReport, FluidicsError> {
        let step = self
            .steps
            .get(label)
            .ok_or_else(|| FluidicsError::UnknownStep(label.to_string()))?;
        self.apply(step, overrides)
    }

    /// Set the step's valves and switches, then start its pumps. A run of the
    /// same label, or of any label pumping on one of the same outputs, is
    /// stopped first; the new trains begin only after the old ones have left
    /// their outputs low.
    pub fn apply(
        &self,
        step: &StepDescriptor,
        overrides: ApplyOverrides,
    ) -> Result<ApplyReport, FluidicsError> {
        let _serial = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(label = %step.label, "applying step");

        for v in &step.valves {
            set_valve(&self.channel(v.output.address), v.output.pin, v.branch)?;
        }

        if !step.switches.is_empty() {
            let mut bank = self.switches.lock().unwrap_or_else(PoisonError::into_inner);
            for sw in &step.switches {
                bank.set_level(sw.pin, sw.high).map_err(|e| {
                    FluidicsError::Switch(format!("pin {} -> {}: {e}", sw.pin, u8::from(sw.high)))
                })?;
            }
        }

        let mut report = ApplyReport {
            label: step.label.clone(),
            run_id: None,
            valves_set: step.valves.len(),
            switches_set: step.switches.len(),
            pumps_started: 0,
            restarted: false,
            preempted: Vec::new(),
            plan: None,
        };
        if step.pumps.is_empty() {
            return Ok(report);
        }

        let mut after = Vec::new();
        for (label, prev) in self.conflicting(step) {
            if label == step.label {
                tracing::info!(label = %label, run_id = prev.run_id, "stopping previous run");
                report.restarted = true;
            } else {
                tracing::info!(
                    label = %step.label,
                    preempted = %label,
                    run_id = prev.run_id,
                    "stopping run sharing a pump output"
                );
                report.preempted.push(label);
            }
            self.retire(&prev);
            after.extend(prev.pumps);
        }

        let pulses = overrides
            .pulses
            .or(step.pulse_count)
            .unwrap_or(self.defaults.pulses);
        let period_s = overrides
            .period_s
            .or(step.period_s)
            .unwrap_or(self.defaults.period_s);
        let plan = PulsePlan::new(pulses, period_s, self.defaults.on_ms, self.defaults.min_off_ms);
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::new(AtomicUsize::new(step.pumps.len()));

        // Held across the spawns: callbacks of fast-finishing trains wait
        // here until the entry they remove exists.
        let mut registry = lock_registry(&self.registry);
        let pumps = step
            .pumps
            .iter()
            .map(|out| {
                let on_done = done_callback(&self.registry, &step.label, run_id, &pending);
                RunningPump::start(
                    step.label.clone(),
                    self.channel(out.address),
                    out.pin,
                    plan,
                    self.clock.clone(),
                    after.clone(),
                    on_done,
                )
            })
            .collect::<Vec<_>>();
        report.pumps_started = pumps.len();
        registry.insert(step.label.clone(), RunningStep { run_id, pumps });
        drop(registry);

        tracing::info!(
            label = %step.label,
            run_id,
            pulses,
            on_ms = plan.on.as_millis() as u64,
            off_ms = plan.off.as_millis() as u64,
            pumps = report.pumps_started,
            "step started"
        );
        report.run_id = Some(run_id);
        report.plan = Some(plan);
        Ok(report)
    }

    /// Stop the run registered under `label`. Returns `false` (and does
    /// nothing) when no run is registered.
    pub fn release(&self, label: &str) -> bool {
        let entry = lock_registry(&self.registry).get(label).cloned();
        match entry {
            Some(run) => {
                tracing::info!(label, run_id = run.run_id, "releasing step");
                self.retire(&run);
                true
            }
            None => {
                tracing::debug!(label, "release of idle step ignored");
                false
            }
        }
    }

    /// Stop every registered run.
    pub fn stop_all(&self) {
        for run in self.running() {
            self.retire(&run);
        }
    }

    /// Stop every registered run and wait until all outputs are low.
    pub fn shutdown(&self) {
        let runs = self.running();
        for run in &runs {
            self.retire(run);
        }
        let draining = std::mem::take(&mut *self.lock_draining());
        for p in &draining {
            p.join();
        }
        if !runs.is_empty() {
            tracing::info!(runs = runs.len(), "sequencer shut down");
        }
    }

    /// Registered runs that must stop before `step` pumps: its own label and
    /// any run driving one of its pump outputs. Sorted by label.
    fn conflicting(&self, step: &StepDescriptor) -> Vec<(String, RunningStep)> {
        let outputs: HashSet<(u8, u8)> = step.pumps.iter().map(|o| (o.address, o.pin)).collect();
        let mut hits: Vec<(String, RunningStep)> = lock_registry(&self.registry)
            .iter()
            .filter(|(label, run)| {
                **label == step.label
                    || run
                        .pumps
                        .iter()
                        .any(|p| outputs.contains(&(p.address(), p.pin())))
            })
            .map(|(label, run)| (label.clone(), run.clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits
    }

    /// Stop `run` and keep its trains until they have exited.
    fn retire(&self, run: &RunningStep) {
        run.stop_all();
        let mut draining = self.lock_draining();
        draining.retain(|p| !p.is_finished());
        draining.extend(run.pumps.iter().cloned());
    }

    fn lock_draining(&self) -> MutexGuard<'_, Vec<RunningPump>> {
        self.draining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> Vec<RunningStep> {
        lock_registry(&self.registry).values().cloned().collect()
    }

    pub fn is_running(&self, label: &str) -> bool {
        lock_registry(&self.registry).contains_key(label)
    }

    /// Block until every pulse thread of `label`'s current run has exited.
    pub fn wait(&self, label: &str) {
        let entry = lock_registry(&self.registry).get(label).cloned();
        if let Some(run) = entry {
            for p in &run.pumps {
                p.join();
            }
        }
    }

    /// Block until every registered run has exited.
    pub fn wait_all(&self) {
        for p in self.running().iter().flat_map(|r| &r.pumps) {
            p.join();
        }
        let draining = std::mem::take(&mut *self.lock_draining());
        for p in &draining {
            p.join();
        }
    }

    /// Snapshot of running steps, sorted by label.
    pub fn status(&self) -> Vec<StepStatus> {
        let mut out: Vec<StepStatus> = lock_registry(&self.registry)
            .iter()
            .map(|(label, run)| StepStatus {
                label: label.clone(),
                run_id: run.run_id,
                pumps: run
                    .pumps
                    .iter()
                    .map(|p| PumpStatus {
                        address: p.address(),
                        pin: p.pin(),
                        pulses: p.plan().pulses,
                        remaining: p.remaining(),
                        on_ms: p.plan().on.as_millis() as u64,
                        off_ms: p.plan().off.as_millis() as u64,
                    })
                    .collect(),
            })
            .collect();
        out.sort_by(|a, b| a.label.cmp(&b.label));
        out
    }
}

fn done_callback(
    registry: &Registry,
    label: &str,
    run_id: u64,
    pending: &Arc<AtomicUsize>,
) -> impl FnOnce(PumpOutcome) + Send + 'static {
    let registry = Arc::clone(registry);
    let label = label.to_string();
    let pending = Arc::clone(pending);
    move |outcome| {
        if outcome == PumpOutcome::Failed {
            tracing::warn!(label = %label, run_id, "pump aborted after command failure");
        }
        if pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut reg = lock_registry(&registry);
        if reg.get(&label).is_some_and(|r| r.run_id == run_id) {
            reg.remove(&label);
            tracing::info!(label = %label, run_id, ?outcome, "step finished");
        }
    }
}

impl<C> StepRunner for Sequencer<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn run_step(&self, label: &str) -> Result<(), FluidicsError> {
        self.apply_label(label, ApplyOverrides::default()).map(|_| ())
    }
}

impl<C> Drop for Sequencer<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
