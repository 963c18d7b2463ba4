// THEORY:
// The `ActuationScheduler` owns the valve bar. It runs two kinds of work
// against one shared I/O image:
//
// 1.  **The cycle**: a dedicated OS thread performs the fieldbus process-data
//     exchange at a fixed rate while the master is enabled. It paces itself
//     with the hybrid sleep/spin wait from `timing`, and it counts consecutive
//     exchange failures. Past a threshold the hardware is declared lost,
//     firing is disabled and every subscriber hears about it. Perception is
//     never stopped by this.
// 2.  **Fire tasks**: each fire request sets its output bits ON immediately and
//     spawns a short async task that waits out the pulse and sets them OFF.
//     A new request on a channel takes that channel over from whatever task
//     held it (latest command wins). Every ON write bumps a per-channel
//     generation counter, and an OFF write only clears channels whose
//     generation is still the one its own ON produced. A stale task can
//     therefore never clear a bit that a newer task asserted. A task that has
//     lost all of its channels is cancelled outright.
//
// All bit writes and the exchange itself happen under one lock, held only for
// the read-modify-write or the exchange call, never across a wait. Lock order
// is always `tasks` before `io`.
//
// `cancel_all` is the emergency stop: master off, pending delayed fires and
// live tasks cancelled, every channel forced off and flushed to the wire.

use crate::core_modules::channel_map::ChannelMap;
use crate::core_modules::ejection::{EjectionCommand, millis};
use crate::core_modules::hardware::IoMaster;
use crate::core_modules::timing::{CancelToken, HybridWait, WaitStrategy, wait_until};
use crate::error::{ConfigError, SchedulerError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

const STATUS_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationConfig {
    /// Process-data exchange rate.
    pub cycle_hz: f64,
    /// Final part of every precise wait that is spent spinning.
    pub spin_window_ms: f64,
    /// Consecutive failed exchanges before the hardware is declared lost.
    pub failure_threshold: u32,
    /// Capacity of the planner-to-scheduler command queue.
    pub command_queue_depth: usize,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            cycle_hz: 500.0,
            spin_window_ms: 15.0,
            failure_threshold: 10,
            command_queue_depth: 64,
        }
    }
}

impl ActuationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cycle_hz > 0.0) {
            return Err(ConfigError::Validation(format!(
                "cycle_hz must be positive, got {}",
                self.cycle_hz
            )));
        }
        if !(self.spin_window_ms >= 0.0) {
            return Err(ConfigError::Validation("spin_window_ms must not be negative".to_string()));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation("failure_threshold must be at least 1".to_string()));
        }
        if self.command_queue_depth == 0 {
            return Err(ConfigError::Validation("command_queue_depth must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.cycle_hz)
    }
}

/// Hardware-side events broadcast to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareStatus {
    Connected,
    MasterOn,
    MasterOff,
    ConnectionLost,
    EmergencyStop,
}

/// The output image plus the generation of the last ON write per channel.
struct IoImage<M> {
    master: M,
    generations: Vec<u64>,
}

struct FireTask {
    cancel: CancelToken,
    /// Channels this task still owns.
    owned: AtomicUsize,
}

impl FireTask {
    fn new(channels: usize) -> Self {
        Self {
            cancel: CancelToken::new(),
            owned: AtomicUsize::new(channels),
        }
    }

    /// Gives up one channel; cancels the task when none are left.
    fn release(&self) {
        if self.owned.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cancel.cancel();
        }
    }
}

struct Shared<M> {
    io: Mutex<IoImage<M>>,
    tasks: Mutex<HashMap<u16, Arc<FireTask>>>,
    /// Replaced on every emergency stop; pending delayed fires hold a clone.
    delayed: Mutex<CancelToken>,
    /// Number of emergency stops so far. A fire that started under an older
    /// count must not write.
    stops: AtomicU64,
    map: ChannelMap,
    wait: Arc<dyn WaitStrategy>,
    config: ActuationConfig,
    master_on: AtomicBool,
    connected: AtomicBool,
    shutdown: AtomicBool,
    status: broadcast::Sender<HardwareStatus>,
}

impl<M: IoMaster> Shared<M> {
    fn announce(&self, status: HardwareStatus) {
        // Having no subscribers is fine.
        let _ = self.status.send(status);
    }

    fn check_ready(&self) -> Result<(), SchedulerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(SchedulerError::Disconnected);
        }
        Ok(())
    }

    fn check_channel(&self, channel: u16) -> Result<(), SchedulerError> {
        if self.map.contains(channel) {
            Ok(())
        } else {
            Err(SchedulerError::ChannelOutOfRange {
                channel,
                channel_count: self.map.channel_count(),
            })
        }
    }

    fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Acquire)
    }

    /// Sets `channels` ON now and spawns the task that sets them OFF.
    /// Nothing is written if an emergency stop has happened since `stops_seen`.
    fn fire(
        self: &Arc<Self>,
        runtime: &Handle,
        channels: &[u16],
        duration: Duration,
        stops_seen: u64,
    ) -> Result<(), SchedulerError> {
        self.check_ready()?;
        let mut targets = channels.to_vec();
        targets.sort_unstable();
        targets.dedup();
        for &channel in &targets {
            self.check_channel(channel)?;
        }
        if targets.is_empty() {
            return Ok(());
        }

        let task = Arc::new(FireTask::new(targets.len()));
        let start = self.wait.now();
        let mut failure = None;
        let claimed: Vec<(u16, u64)> = {
            let mut tasks = self.tasks.lock();
            // `stop_everything` bumps the count before it takes this lock.
            if self.stop_count() != stops_seen {
                debug!(?targets, "fire overtaken by emergency stop");
                return Ok(());
            }
            let mut io = self.io.lock();
            targets
                .iter()
                .map(|&channel| {
                    if let Some(previous) = tasks.insert(channel, Arc::clone(&task)) {
                        previous.release();
                    }
                    let index = usize::from(channel - 1);
                    io.generations[index] += 1;
                    if let Some(address) = self.map.resolve(channel) {
                        if let Err(error) = io.master.write_output(address.module, address.channel, true) {
                            failure.get_or_insert(error);
                        }
                    }
                    (channel, io.generations[index])
                })
                .collect()
        };
        trace!(?targets, ?duration, "channels on");

        // The OFF side is spawned even after a failed write so that nothing
        // that did go ON is left without a timer.
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            if wait_until(shared.wait.as_ref(), start + duration, &task.cancel).await {
                shared.clear_if_current(&claimed);
            }
            shared.forget(&task, &claimed);
        });

        match failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn clear_if_current(&self, claimed: &[(u16, u64)]) {
        let mut io = self.io.lock();
        for &(channel, generation) in claimed {
            if io.generations[usize::from(channel - 1)] != generation {
                continue;
            }
            if let Some(address) = self.map.resolve(channel) {
                if let Err(error) = io.master.write_output(address.module, address.channel, false) {
                    warn!(channel, %error, "failed to clear output");
                }
            }
        }
        trace!(channels = claimed.len(), "pulse complete");
    }

    fn forget(&self, task: &Arc<FireTask>, claimed: &[(u16, u64)]) {
        let mut tasks = self.tasks.lock();
        for (channel, _) in claimed {
            if tasks.get(channel).is_some_and(|current| Arc::ptr_eq(current, task)) {
                tasks.remove(channel);
            }
        }
    }

    /// Cancels every live and pending fire and forces all outputs off.
    /// With `flush` the cleared image is pushed out with one extra exchange.
    fn stop_everything(&self, flush: bool) {
        let previous_epoch = {
            let mut delayed = self.delayed.lock();
            self.stops.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut *delayed)
        };
        previous_epoch.cancel();

        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.drain() {
            task.cancel.cancel();
        }
        let mut io = self.io.lock();
        for channel in 1..=self.map.channel_count() {
            io.generations[usize::from(channel - 1)] += 1;
            if let Some(address) = self.map.resolve(channel) {
                if let Err(error) = io.master.write_output(address.module, address.channel, false) {
                    error!(channel, %error, "failed to force output off");
                }
            }
        }
        if flush {
            let now = self.wait.now();
            if let Err(error) = io.master.exchange(now) {
                warn!(%error, "could not flush cleared outputs");
            }
        }
    }

    fn connection_lost(&self, failures: u32) {
        self.connected.store(false, Ordering::Release);
        self.master_on.store(false, Ordering::Release);
        self.stop_everything(false);
        error!(failures, "fieldbus connection lost, firing disabled");
        self.announce(HardwareStatus::ConnectionLost);
    }
}

/// The cyclic exchange loop. Runs on its own thread until shutdown.
fn run_cycle<M: IoMaster>(shared: Arc<Shared<M>>) {
    let period = shared.config.cycle_period();
    let mut failures = 0u32;
    let mut next = shared.wait.now() + period;

    while !shared.shutdown.load(Ordering::Acquire) {
        let active = shared.master_on.load(Ordering::Acquire) && shared.connected.load(Ordering::Acquire);
        if !active {
            failures = 0;
            std::thread::sleep(period);
            next = shared.wait.now() + period;
            continue;
        }

        let result = {
            let mut io = shared.io.lock();
            let now = shared.wait.now();
            io.master.exchange(now)
        };
        match result {
            Ok(()) => failures = 0,
            Err(error) => {
                failures += 1;
                warn!(%error, failures, "process data exchange failed");
                if failures >= shared.config.failure_threshold {
                    shared.connection_lost(failures);
                    failures = 0;
                }
            }
        }

        shared.wait.block_until(next);
        next += period;
        let now = shared.wait.now();
        if next < now {
            trace!(behind = ?(now - next), "cycle overrun");
            next = now + period;
        }
    }
    debug!("actuation cycle stopped");
}

/// Drives the valve bar through an `IoMaster`.
pub struct ActuationScheduler<M: IoMaster> {
    shared: Arc<Shared<M>>,
    runtime: Handle,
    cycle: Option<JoinHandle<()>>,
}

impl<M: IoMaster> ActuationScheduler<M> {
    /// Must be called from within a tokio runtime; fire tasks are spawned on it.
    pub fn new(master: M, config: ActuationConfig) -> Result<Self, ConfigError> {
        let wait = Arc::new(HybridWait::new(millis(config.spin_window_ms)));
        Self::with_wait_strategy(master, config, wait)
    }

    pub fn with_wait_strategy(
        master: M,
        config: ActuationConfig,
        wait: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            ConfigError::Validation("actuation scheduler must be created inside a tokio runtime".to_string())
        })?;

        let topology = master.topology();
        let map = ChannelMap::from_topology(&topology);
        let channel_count = map.channel_count();
        if channel_count == 0 {
            return Err(ConfigError::Validation("fieldbus master reports no output channels".to_string()));
        }

        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let shared = Arc::new(Shared {
            io: Mutex::new(IoImage {
                master,
                generations: vec![0; usize::from(channel_count)],
            }),
            tasks: Mutex::new(HashMap::new()),
            delayed: Mutex::new(CancelToken::new()),
            stops: AtomicU64::new(0),
            map,
            wait,
            config,
            master_on: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            status,
        });

        let cycle_shared = Arc::clone(&shared);
        let cycle = std::thread::Builder::new()
            .name("actuation-cycle".to_string())
            .spawn(move || run_cycle(cycle_shared))?;

        info!(
            modules = topology.len(),
            channels = channel_count,
            cycle_hz = shared.config.cycle_hz,
            "actuation scheduler ready"
        );
        shared.announce(HardwareStatus::Connected);
        Ok(Self {
            shared,
            runtime,
            cycle: Some(cycle),
        })
    }

    pub fn channel_count(&self) -> u16 {
        self.shared.map.channel_count()
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.shared.map
    }

    pub fn config(&self) -> &ActuationConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HardwareStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_master_on(&self) -> bool {
        self.shared.master_on.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Starts the cyclic exchange.
    pub fn set_master_on(&self) -> Result<(), SchedulerError> {
        self.shared.check_ready()?;
        if !self.shared.master_on.swap(true, Ordering::AcqRel) {
            info!("master on");
            self.shared.announce(HardwareStatus::MasterOn);
        }
        Ok(())
    }

    /// Pauses the cyclic exchange. Output bits are left as they are.
    pub fn set_master_off(&self) {
        if self.shared.master_on.swap(false, Ordering::AcqRel) {
            info!("master off");
            self.shared.announce(HardwareStatus::MasterOff);
        }
    }

    /// Re-enables firing after a lost connection. The master stays off.
    pub fn reconnect(&self) -> Result<(), SchedulerError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if !self.shared.connected.swap(true, Ordering::AcqRel) {
            info!("fieldbus reconnected");
            self.shared.announce(HardwareStatus::Connected);
        }
        Ok(())
    }

    /// Pulses one channel for `duration`, replacing any pulse already running on it.
    pub fn fire_channel(&self, channel: u16, duration: Duration) -> Result<(), SchedulerError> {
        self.fire_channels(&[channel], duration)
    }

    /// Pulses several channels together. Every channel is validated before any
    /// bit changes.
    pub fn fire_channels(&self, channels: &[u16], duration: Duration) -> Result<(), SchedulerError> {
        self.shared
            .fire(&self.runtime, channels, duration, self.shared.stop_count())
    }

    /// Fires `command` once its delay, measured from its timestamp, has passed.
    pub fn schedule(&self, command: &EjectionCommand) -> Result<(), SchedulerError> {
        self.shared.check_ready()?;
        for &channel in &command.channels {
            self.shared.check_channel(channel)?;
        }
        if command.delay.is_zero() {
            return self.fire_channels(&command.channels, command.duration);
        }

        let (epoch, stops_seen) = {
            let delayed = self.shared.delayed.lock();
            (delayed.clone(), self.shared.stop_count())
        };
        let deadline = command.timestamp + command.delay;
        let shared = Arc::clone(&self.shared);
        let runtime = self.runtime.clone();
        let channels = command.channels.clone();
        let duration = command.duration;
        let blob_id = command.blob_id;
        debug!(blob_id, ?channels, delay = ?command.delay, provenance = ?command.provenance, "fire scheduled");

        self.runtime.spawn(async move {
            if !wait_until(shared.wait.as_ref(), deadline, &epoch).await {
                trace!(blob_id, "scheduled fire cancelled");
                return;
            }
            if let Err(error) = shared.fire(&runtime, &channels, duration, stops_seen) {
                warn!(blob_id, %error, "scheduled fire dropped");
            }
        });
        Ok(())
    }

    /// Current state of a channel's output bit.
    pub fn channel_state(&self, channel: u16) -> Result<bool, SchedulerError> {
        self.shared.check_channel(channel)?;
        let address = self.shared.map.resolve(channel).ok_or(SchedulerError::ChannelOutOfRange {
            channel,
            channel_count: self.channel_count(),
        })?;
        let io = self.shared.io.lock();
        Ok(io.master.read_output(address.module, address.channel)?)
    }

    /// Fires every channel from `start` upward, one after the other, each for
    /// `pulse` followed by `inter_channel_delay`. Returns how many were fired.
    pub async fn test_all_channels(
        &self,
        start: u16,
        pulse: Duration,
        inter_channel_delay: Duration,
        cancel: &CancelToken,
    ) -> Result<u16, SchedulerError> {
        self.shared.check_channel(start)?;
        let mut fired = 0u16;
        for channel in start..=self.channel_count() {
            if cancel.is_cancelled() {
                break;
            }
            self.fire_channel(channel, pulse)?;
            fired += 1;
            debug!(channel, "diagnostic pulse");

            let deadline = self.shared.wait.now() + pulse + inter_channel_delay;
            if !wait_until(self.shared.wait.as_ref(), deadline, cancel).await {
                break;
            }
        }
        info!(fired, cancelled = cancel.is_cancelled(), "channel sweep finished");
        Ok(fired)
    }

    /// Emergency stop.
    pub fn cancel_all(&self) {
        self.shared.master_on.store(false, Ordering::Release);
        self.shared.stop_everything(true);
        warn!("emergency stop: all channels forced off");
        self.shared.announce(HardwareStatus::EmergencyStop);
    }

    /// Emergency stop, then stops the cycle thread. Further requests fail.
    pub fn shutdown(&mut self) {
        if self.cycle.is_none() {
            return;
        }
        self.cancel_all();
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(cycle) = self.cycle.take() {
            if cycle.join().is_err() {
                error!("actuation cycle thread panicked");
            }
        }
        info!("actuation scheduler shut down");
    }
}

impl<M: IoMaster> Drop for ActuationScheduler<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::ejection::Provenance;
    use crate::core_modules::hardware::{SimulatedHandle, SimulatedMaster};
    use std::time::Instant;
    use tokio::time::{sleep, sleep_until, timeout};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    async fn at(start: Instant, offset_ms: u64) {
        sleep_until(tokio::time::Instant::from_std(start + ms(offset_ms))).await;
    }

    fn build(modules: &[usize]) -> (ActuationScheduler<SimulatedMaster>, SimulatedHandle) {
        let (master, handle) = SimulatedMaster::new(modules);
        (ActuationScheduler::new(master, ActuationConfig::default()).unwrap(), handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pulse_turns_channel_on_then_off() {
        let (scheduler, _) = build(&[8, 8]);
        assert_eq!(scheduler.channel_count(), 16);

        let start = Instant::now();
        scheduler.fire_channel(12, ms(60)).unwrap();
        assert!(scheduler.channel_state(12).unwrap());
        assert!(!scheduler.channel_state(11).unwrap());

        at(start, 160).await;
        assert!(!scheduler.channel_state(12).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refire_replaces_a_longer_pulse() {
        let (scheduler, _) = build(&[8]);
        let start = Instant::now();
        scheduler.fire_channel(5, ms(300)).unwrap();
        at(start, 20).await;
        scheduler.fire_channel(5, ms(100)).unwrap();

        at(start, 80).await;
        assert!(scheduler.channel_state(5).unwrap());
        // The replacement ends around 120 ms, well before the first pulse would.
        at(start, 200).await;
        assert!(!scheduler.channel_state(5).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_pulse_never_clears_a_newer_one() {
        let (scheduler, _) = build(&[8]);
        let start = Instant::now();
        scheduler.fire_channel(5, ms(60)).unwrap();
        at(start, 20).await;
        scheduler.fire_channel(5, ms(200)).unwrap();

        at(start, 120).await;
        assert!(scheduler.channel_state(5).unwrap());
        at(start, 320).await;
        assert!(!scheduler.channel_state(5).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn partially_preempted_group_keeps_its_other_channels() {
        let (scheduler, _) = build(&[8]);
        let start = Instant::now();
        scheduler.fire_channels(&[3, 4, 5], ms(80)).unwrap();
        at(start, 10).await;
        scheduler.fire_channels(&[5], ms(250)).unwrap();

        at(start, 40).await;
        assert!(scheduler.channel_state(3).unwrap());
        at(start, 160).await;
        assert!(!scheduler.channel_state(3).unwrap());
        assert!(!scheduler.channel_state(4).unwrap());
        assert!(scheduler.channel_state(5).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_range_requests_touch_nothing() {
        let (scheduler, _) = build(&[8]);
        assert_eq!(
            scheduler.fire_channels(&[2, 9], ms(50)),
            Err(SchedulerError::ChannelOutOfRange { channel: 9, channel_count: 8 })
        );
        assert!(!scheduler.channel_state(2).unwrap());
        assert!(scheduler.fire_channel(0, ms(50)).is_err());
        assert!(scheduler.channel_state(9).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scheduled_fire_waits_for_its_delay() {
        let (scheduler, _) = build(&[8]);
        let start = Instant::now();
        let command = EjectionCommand {
            blob_id: 7,
            class_id: 1,
            center_channel: 3,
            channels: vec![2, 3, 4],
            delay: ms(60),
            duration: ms(80),
            timestamp: start,
            provenance: Provenance::Tracker,
        };
        scheduler.schedule(&command).unwrap();

        at(start, 30).await;
        assert!(!scheduler.channel_state(3).unwrap());
        at(start, 100).await;
        assert!(scheduler.channel_state(2).unwrap());
        assert!(scheduler.channel_state(4).unwrap());
        at(start, 240).await;
        assert!(!scheduler.channel_state(3).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_all_stops_live_and_pending_fires() {
        let (scheduler, _) = build(&[8]);
        let mut status = scheduler.subscribe();
        scheduler.set_master_on().unwrap();
        scheduler.fire_channels(&[1, 2], ms(1000)).unwrap();
        scheduler
            .schedule(&EjectionCommand {
                blob_id: 1,
                class_id: 0,
                center_channel: 7,
                channels: vec![7],
                delay: ms(50),
                duration: ms(500),
                timestamp: Instant::now(),
                provenance: Provenance::Manual,
            })
            .unwrap();

        scheduler.cancel_all();
        assert!(!scheduler.is_master_on());
        for channel in 1..=8 {
            assert!(!scheduler.channel_state(channel).unwrap());
        }

        sleep(ms(150)).await;
        assert!(!scheduler.channel_state(7).unwrap());
        assert_eq!(status.recv().await.unwrap(), HardwareStatus::MasterOn);
        assert_eq!(status.recv().await.unwrap(), HardwareStatus::EmergencyStop);

        // Firing still works after an emergency stop.
        scheduler.fire_channel(3, ms(30)).unwrap();
        assert!(scheduler.channel_state(3).unwrap());
    }

    /// Every clock read takes 50 ms, which leaves a wide gap between a
    /// delayed fire waking up and it reaching the output image.
    struct SlowClock;

    impl WaitStrategy for SlowClock {
        fn spin_window(&self) -> Duration {
            Duration::ZERO
        }

        fn now(&self) -> Instant {
            std::thread::sleep(ms(50));
            Instant::now()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn emergency_stop_beats_a_fire_already_waking_up() {
        let (master, _) = SimulatedMaster::new(&[8]);
        let scheduler =
            ActuationScheduler::with_wait_strategy(master, ActuationConfig::default(), Arc::new(SlowClock)).unwrap();
        let start = Instant::now();
        scheduler
            .schedule(&EjectionCommand {
                blob_id: 3,
                class_id: 0,
                center_channel: 7,
                channels: vec![7],
                delay: ms(10),
                duration: ms(5000),
                timestamp: start,
                provenance: Provenance::Manual,
            })
            .unwrap();

        at(start, 125).await;
        scheduler.cancel_all();
        assert!(!scheduler.channel_state(7).unwrap());
        sleep(ms(300)).await;
        assert!(!scheduler.channel_state(7).unwrap());

        // A direct fire issued after the stop is not affected.
        scheduler.fire_channel(2, ms(5000)).unwrap();
        assert!(scheduler.channel_state(2).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cycle_exchanges_only_while_master_is_on() {
        let (scheduler, handle) = build(&[4]);
        sleep(ms(30)).await;
        assert_eq!(handle.exchange_count(), 0);

        scheduler.set_master_on().unwrap();
        sleep(ms(60)).await;
        assert!(handle.exchange_count() > 0);

        scheduler.set_master_off();
        sleep(ms(20)).await;
        let paused = handle.exchange_count();
        sleep(ms(40)).await;
        assert_eq!(handle.exchange_count(), paused);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_exchange_failures_disable_firing() {
        let (master, handle) = SimulatedMaster::new(&[4]);
        let config = ActuationConfig {
            cycle_hz: 1000.0,
            failure_threshold: 3,
            ..ActuationConfig::default()
        };
        let scheduler = ActuationScheduler::new(master, config).unwrap();
        let mut status = scheduler.subscribe();
        scheduler.set_master_on().unwrap();
        handle.set_failing(true);

        let lost = timeout(Duration::from_secs(2), async {
            loop {
                if status.recv().await.unwrap() == HardwareStatus::ConnectionLost {
                    break;
                }
            }
        })
        .await;
        assert!(lost.is_ok());
        assert!(!scheduler.is_connected());
        assert!(!scheduler.is_master_on());
        assert_eq!(scheduler.fire_channel(1, ms(10)), Err(SchedulerError::Disconnected));
        assert_eq!(scheduler.set_master_on(), Err(SchedulerError::Disconnected));

        handle.set_failing(false);
        scheduler.reconnect().unwrap();
        scheduler.fire_channel(1, ms(10)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn channel_sweep_fires_each_channel_once() {
        let (scheduler, _) = build(&[4]);
        let fired = scheduler
            .test_all_channels(1, ms(5), ms(1), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(fired, 4);
        sleep(ms(40)).await;
        for channel in 1..=4 {
            assert!(!scheduler.channel_state(channel).unwrap());
        }

        let partial = scheduler
            .test_all_channels(3, ms(5), ms(1), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(partial, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn channel_sweep_stops_when_cancelled() {
        let (scheduler, _) = build(&[8]);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(scheduler.test_all_channels(1, ms(5), ms(1), &cancel).await, Ok(0));

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(ms(45)).await;
            canceller.cancel();
        });
        let fired = scheduler.test_all_channels(1, ms(20), ms(10), &cancel).await.unwrap();
        assert!(fired >= 1 && fired < 8);

        assert!(scheduler.test_all_channels(9, ms(5), ms(1), &CancelToken::new()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_rejects_further_requests() {
        let (mut scheduler, _) = build(&[4]);
        scheduler.fire_channel(1, ms(500)).unwrap();
        scheduler.shutdown();
        assert!(!scheduler.channel_state(1).unwrap());
        assert_eq!(scheduler.fire_channel(1, ms(5)), Err(SchedulerError::ShutDown));
    }
}
