//! Runs a simulator on its own thread.
//!
//! The simulation thread owns the [`Simulator`]. Everything the host does
//! goes through a [`DriverHandle`]: structural edits travel the modification
//! queue, inputs sit in a mutex-guarded slot that each tick clones, and the
//! state of the viewed instance comes back as an `Arc<Snapshot>` published
//! once per host frame.

use std::collections::{BTreeSet, VecDeque};
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::busmap::PinValues;
use crate::config::SimConfig;
use crate::error::Result;
use crate::modification::{self, ModificationQueue, ModificationReceiver};
use crate::simulator::{Simulator, TickInputs};
use crate::snapshot::Snapshot;

/// Which instance the host is looking at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewState {
    Detached,
    Viewing(Vec<u32>),
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    step_requested: AtomicBool,
    tick_count: AtomicU64,
    frame: AtomicU64,
    /// f64 bits of the measured ticks per second.
    tps: AtomicU64,
    inputs: Mutex<TickInputs>,
    view: Mutex<ViewState>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ticks per second over a rolling window, counted in buckets so the
/// memory used does not grow with the tick rate.
struct TpsMeter {
    window: Duration,
    bucket: Duration,
    buckets: VecDeque<(Instant, u64)>,
    started: Instant,
}

impl TpsMeter {
    const BUCKETS: u32 = 16;

    fn new(window: Duration) -> TpsMeter {
        TpsMeter {
            window,
            bucket: window / Self::BUCKETS,
            buckets: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn record(&mut self, now: Instant) -> f64 {
        match self.buckets.back_mut() {
            Some((start, count)) if now.duration_since(*start) < self.bucket => *count += 1,
            _ => self.buckets.push_back((now, 1)),
        }
        while let Some((start, _)) = self.buckets.front() {
            if now.duration_since(*start) > self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }

        let span = now.duration_since(self.started).min(self.window).as_secs_f64();
        let total: u64 = self.buckets.iter().map(|(_, c)| c).sum();
        if span > 0.0 {
            total as f64 / span
        } else {
            0.0
        }
    }
}

pub struct TickDriver {
    simulator: Simulator,
    start_paused: bool,
}

impl TickDriver {
    pub fn new(simulator: Simulator) -> TickDriver {
        TickDriver {
            simulator,
            start_paused: false,
        }
    }

    /// Start without ticking until resumed or stepped.
    pub fn start_paused(mut self) -> TickDriver {
        self.start_paused = true;
        self
    }

    /// Moves the simulator onto a new thread and starts the loop.
    pub fn spawn(self) -> Result<DriverHandle> {
        let config = self.simulator.context().config.clone();
        let (queue, receiver) = modification::channel();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(self.start_paused),
            step_requested: AtomicBool::new(false),
            tick_count: AtomicU64::new(self.simulator.tick_count()),
            frame: AtomicU64::new(0),
            tps: AtomicU64::new(0f64.to_bits()),
            inputs: Mutex::new(TickInputs::default()),
            view: Mutex::new(ViewState::Viewing(Vec::new())),
            snapshot: RwLock::new(None),
        });

        let thread = {
            let shared = shared.clone();
            let config = config.clone();
            let simulator = self.simulator;
            thread::Builder::new()
                .name(format!("chipsim-{}", simulator.chip.name))
                .spawn(move || run(simulator, receiver, shared, config))?
        };

        Ok(DriverHandle {
            shared,
            queue,
            config,
            thread: Some(thread),
        })
    }
}

fn run(
    mut sim: Simulator,
    receiver: ModificationReceiver,
    shared: Arc<Shared>,
    config: SimConfig,
) -> Simulator {
    log::info!(
        "Simulating {} at {} ticks/s, {} ticks per clock transition",
        sim.chip.name,
        config.target_ticks_per_second,
        config.steps_per_clock_transition
    );
    let mut meter = TpsMeter::new(config.tps_window());
    let mut published: Option<u64> = None;
    let mut last_error: Option<String> = None;

    while shared.running.load(Ordering::Acquire) {
        apply_batch(&mut sim, &receiver);
        publish(&sim, &shared, &mut published);

        // A step request only counts while paused, never carried into one.
        let step_requested = shared.step_requested.swap(false, Ordering::AcqRel);
        if shared.paused.load(Ordering::Acquire) && !step_requested {
            shared.tps.store(0f64.to_bits(), Ordering::Release);
            thread::sleep(config.paused_poll());
            continue;
        }

        let started = Instant::now();
        let inputs = lock(&shared.inputs).clone();
        match sim.step(&inputs) {
            Ok(()) => last_error = None,
            Err(e) => {
                if last_error.as_deref() != Some(e.msg.as_str()) {
                    log::error!("Tick failed: {}", e);
                    last_error = Some(e.msg);
                }
            }
        }
        shared.tick_count.store(sim.tick_count(), Ordering::Release);
        shared
            .tps
            .store(meter.record(started).to_bits(), Ordering::Release);

        if let Some(duration) = config.tick_duration() {
            while started.elapsed() < duration {
                hint::spin_loop();
            }
        }
    }

    // Edits queued before the stop still land in the simulator handed back.
    apply_batch(&mut sim, &receiver);
    log::info!("Stopped {} after {} ticks", sim.chip.name, sim.tick_count());
    sim
}

fn apply_batch(sim: &mut Simulator, receiver: &ModificationReceiver) {
    for m in receiver.drain() {
        let path = m.path().to_vec();
        if let Err(e) = sim.apply(m) {
            log::warn!("Skipping modification at {:?}: {}", path, e);
        }
    }
}

/// Copies the viewed instance into a new snapshot once per frame.
fn publish(sim: &Simulator, shared: &Shared, published: &mut Option<u64>) {
    let frame = shared.frame.load(Ordering::Acquire);
    if *published == Some(frame) {
        return;
    }
    let path = match &*lock(&shared.view) {
        ViewState::Detached => return,
        ViewState::Viewing(path) => path.clone(),
    };
    *published = Some(frame);

    match sim.instance(&path) {
        Some(inst) => {
            let snapshot = Arc::new(Snapshot::new(sim.tick_count(), frame, path, inst));
            *shared
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        }
        None => log::warn!(
            "Viewed instance {:?} no longer exists, skipping frame {}",
            path,
            frame
        ),
    }
}

/// The host's side of a running simulation. Dropping it stops the thread.
pub struct DriverHandle {
    shared: Arc<Shared>,
    queue: ModificationQueue,
    config: SimConfig,
    thread: Option<JoinHandle<Simulator>>,
}

impl DriverHandle {
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        log::info!("Paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        log::info!("Resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Runs exactly one tick while paused. Ignored while running.
    pub fn step_once(&self) {
        if !self.is_paused() {
            log::debug!("Step requested while running, ignoring");
            return;
        }
        self.shared.step_requested.store(true, Ordering::Release);
    }

    /// Root input values used from the next tick on.
    pub fn set_inputs(&self, pins: PinValues) {
        lock(&self.shared.inputs).pins = pins;
    }

    pub fn set_keys_down(&self, keys: BTreeSet<u32>) {
        lock(&self.shared.inputs).keys_down = keys;
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.tick_count.load(Ordering::Acquire)
    }

    pub fn ticks_per_second(&self) -> f64 {
        f64::from_bits(self.shared.tps.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn queue(&self) -> ModificationQueue {
        self.queue.clone()
    }

    /// Start publishing snapshots of the instance at `path`.
    pub fn enter_view(&self, path: Vec<u32>) {
        *lock(&self.shared.view) = ViewState::Viewing(path);
        self.shared.frame.fetch_add(1, Ordering::AcqRel);
    }

    /// Stop publishing snapshots.
    pub fn exit_view(&self) {
        *lock(&self.shared.view) = ViewState::Detached;
    }

    pub fn view(&self) -> ViewState {
        lock(&self.shared.view).clone()
    }

    /// Called once per host frame. Asks for a fresh snapshot and returns the
    /// latest one published.
    pub fn update(&self) -> Option<Arc<Snapshot>> {
        self.shared.frame.fetch_add(1, Ordering::AcqRel);
        self.snapshot()
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Blocks until at least `ticks` ticks have run, or `timeout` passes.
    pub fn wait_for_ticks(&self, ticks: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.tick_count() < ticks {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Stops the loop and hands the simulator back.
    pub fn stop(&mut self) -> Option<Simulator> {
        self.shared.running.store(false, Ordering::Release);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(sim) => Some(sim),
            Err(_) => {
                log::error!("Simulation thread panicked");
                None
            }
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SimContext;
    use crate::description::{ChipDescription, SubChipDescription};
    use crate::instance::PinAddress;
    use crate::modification::Modification;
    use crate::netlist::test::{context, pin, wire};
    use more_asserts::assert_ge;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn blinker(steps: u32) -> Simulator {
        let desc = ChipDescription {
            name: String::from("Blinker"),
            inputs: vec![],
            outputs: vec![pin(0, "out")],
            sub_chips: vec![SubChipDescription::new(1, "CLOCK")],
            wires: vec![wire(1, 0, 0, 0)],
        };
        let mut ctx: SimContext = context(vec![]);
        ctx.config.steps_per_clock_transition = steps;
        ctx.config.target_ticks_per_second = 0.0;
        ctx.config.paused_poll_ms = 1;
        Simulator::from_description(&desc, Arc::new(ctx)).unwrap()
    }

    #[test]
    fn test_runs_and_stops() {
        let mut handle = TickDriver::new(blinker(2)).spawn().unwrap();
        assert!(handle.wait_for_ticks(100, TIMEOUT));
        let sim = handle.stop().expect("simulator back");
        assert_ge!(sim.tick_count(), 100);
        assert!(handle.stop().is_none());
    }

    #[test]
    fn test_paused_step_once() {
        let mut handle = TickDriver::new(blinker(1)).start_paused().spawn().unwrap();
        assert!(handle.is_paused());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.tick_count(), 0);

        handle.step_once();
        assert!(handle.wait_for_ticks(1, TIMEOUT));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.tick_count(), 1);

        handle.resume();
        assert!(handle.wait_for_ticks(10, TIMEOUT));
        let sim = handle.stop().unwrap();
        assert_ge!(sim.tick_count(), 10);
    }

    #[test]
    fn test_step_while_running_does_not_outlive_pause() {
        let mut handle = TickDriver::new(blinker(1)).spawn().unwrap();
        assert!(handle.wait_for_ticks(10, TIMEOUT));
        handle.step_once();
        assert!(!handle.shared.step_requested.load(Ordering::Acquire));

        handle.pause();
        thread::sleep(Duration::from_millis(20));
        let paused_at = handle.tick_count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.tick_count(), paused_at);

        handle.step_once();
        assert!(handle.wait_for_ticks(paused_at + 1, TIMEOUT));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.tick_count(), paused_at + 1);
        handle.stop();
    }

    #[test]
    fn test_modifications_apply_between_ticks() {
        let mut handle = TickDriver::new(blinker(1)).start_paused().spawn().unwrap();
        let queue = handle.queue();
        queue
            .push(Modification::RemoveChild {
                path: vec![],
                child: 1,
            })
            .unwrap();
        // Unknown path, logged and skipped.
        queue
            .push(Modification::RemoveChild {
                path: vec![8],
                child: 1,
            })
            .unwrap();
        queue
            .push(Modification::AddChild {
                path: vec![],
                child: SubChipDescription::new(2, "KEY"),
            })
            .unwrap();
        handle.step_once();
        assert!(handle.wait_for_ticks(1, TIMEOUT));

        let sim = handle.stop().unwrap();
        assert!(sim.instance(&[1]).is_none());
        assert!(sim.instance(&[2]).is_some());
    }

    #[test]
    fn test_snapshots_follow_view() {
        let handle = TickDriver::new(blinker(1)).start_paused().spawn().unwrap();
        handle.step_once();
        assert!(handle.wait_for_ticks(1, TIMEOUT));

        let deadline = Instant::now() + TIMEOUT;
        let snapshot = loop {
            match handle.update() {
                Some(s) if s.tick >= 1 => break s,
                _ => {
                    assert!(Instant::now() < deadline, "no snapshot published");
                    thread::sleep(Duration::from_millis(2));
                }
            }
        };
        assert!(snapshot.path.is_empty());
        assert!(snapshot.pin(PinAddress::new(1, 0)).is_some());

        // A path that does not resolve leaves the last snapshot in place.
        handle.enter_view(vec![42]);
        handle.update();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.snapshot().unwrap().path, Vec::<u32>::new());

        handle.enter_view(vec![1]);
        let deadline = Instant::now() + TIMEOUT;
        while handle.update().map_or(true, |s| s.path != vec![1]) {
            assert!(Instant::now() < deadline, "view change not published");
            thread::sleep(Duration::from_millis(2));
        }
        handle.exit_view();
        assert_eq!(handle.view(), ViewState::Detached);
    }

    #[test]
    fn test_tps_meter() {
        let mut meter = TpsMeter::new(Duration::from_secs(1));
        let start = meter.started;
        let mut rate = 0.0;
        for i in 0..=100u64 {
            rate = meter.record(start + Duration::from_millis(i * 10));
        }
        assert!((rate - 100.0).abs() < 10.0, "rate {}", rate);
    }
}
