// THEORY:
// The `live_pipeline` module runs the decision core against real time. It has
// three moving parts:
//
// 1.  **Perception thread**: a dedicated OS thread pulls raw lines from the
//     `LineSource`, runs the `SortingPipeline` and offers every planned command
//     to a bounded queue. Lines are processed strictly in order with increasing
//     indices. When the queue is full the command is dropped with a warning;
//     perception never blocks on actuation. At end of input the source is
//     rewound, so an offline file can stand in for an endless conveyor.
// 2.  **Dispatcher task**: drains the queue and hands each command to the
//     `ActuationScheduler`, which owns all timing from there on.
// 3.  **Status monitor**: logs every `HardwareStatus` the scheduler broadcasts.
//
// A lost fieldbus shows up as rejected commands at the dispatcher; the
// perception thread keeps tracking regardless.

use crate::core_modules::actuation::{ActuationScheduler, HardwareStatus};
use crate::core_modules::ejection::EjectionCommand;
use crate::core_modules::hardware::IoMaster;
use crate::core_modules::line_source::LineSource;
use crate::core_modules::timing::{CancelToken, HybridWait, WaitStrategy};
use crate::error::{ConfigError, RunError, SourceError};
use crate::pipeline::SortingPipeline;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Spin window for line pacing; line periods are only a few milliseconds.
const PACING_SPIN_WINDOW: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct LiveOptions {
    /// Stop after this many lines. `None` runs until `stop`.
    pub max_lines: Option<u64>,
    /// Pace perception to this line rate. `None` runs as fast as possible.
    pub line_rate_hz: Option<f64>,
    /// Start the source over at end of input.
    pub rewind: bool,
    /// How long the scheduler is kept alive after the last command so that
    /// pending fires can complete.
    pub drain: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            max_lines: None,
            line_rate_hz: None,
            rewind: true,
            drain: Duration::ZERO,
        }
    }
}

/// Counters for a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSummary {
    pub lines: u64,
    pub blobs_closed: u64,
    pub commands_planned: u64,
    pub commands_queued: u64,
    pub commands_dropped: u64,
    pub commands_dispatched: u64,
    pub commands_rejected: u64,
    pub rewinds: u64,
}

/// What a finished run hands back.
pub struct LiveOutcome {
    /// The pipeline, with its tracker state and label history intact.
    pub pipeline: SortingPipeline,
    pub summary: LiveSummary,
}

struct Perceived {
    pipeline: SortingPipeline,
    queued: u64,
    dropped: u64,
    rewinds: u64,
}

#[derive(Default)]
struct Dispatched {
    dispatched: u64,
    rejected: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum Offer {
    Queued,
    Dropped,
    Closed,
}

/// Non-blocking hand-off from perception to the dispatcher.
fn offer(queue: &mpsc::Sender<EjectionCommand>, command: &EjectionCommand) -> Offer {
    match queue.try_send(command.clone()) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(dropped)) => {
            warn!(blob = dropped.blob_id, channel = dropped.center_channel, "command queue full, ejection dropped");
            Offer::Dropped
        }
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

fn perceive(
    mut pipeline: SortingPipeline,
    mut source: Box<dyn LineSource>,
    queue: mpsc::Sender<EjectionCommand>,
    stop: Arc<AtomicBool>,
    options: LiveOptions,
) -> Result<Perceived, SourceError> {
    let mut line = vec![0.0; source.line_len()];
    let (mut queued, mut dropped, mut rewinds) = (0u64, 0u64, 0u64);
    let mut processed = 0u64;

    let pacing = options
        .line_rate_hz
        .filter(|hz| *hz > 0.0)
        .map(|hz| Duration::from_secs_f64(1.0 / hz));
    let wait = HybridWait::new(PACING_SPIN_WINDOW);
    let mut next = Instant::now();

    'lines: while !stop.load(Ordering::Acquire) {
        if options.max_lines.is_some_and(|max| processed >= max) {
            break;
        }
        if !source.next_line(&mut line)? {
            if !options.rewind {
                break;
            }
            source.rewind();
            rewinds += 1;
            debug!(rewinds, "line source rewound");
            if !source.next_line(&mut line)? {
                break;
            }
        }

        let report = pipeline.process_line(&line);
        processed += 1;
        for command in report.commands {
            match offer(&queue, command) {
                Offer::Queued => queued += 1,
                Offer::Dropped => dropped += 1,
                Offer::Closed => {
                    warn!("dispatcher has gone away, perception stopping");
                    break 'lines;
                }
            }
        }

        if let Some(period) = pacing {
            next += period;
            wait.block_until(next);
        }
    }

    info!(lines = processed, queued, dropped, "perception finished");
    Ok(Perceived {
        pipeline,
        queued,
        dropped,
        rewinds,
    })
}

/// A running perception thread, dispatcher and status monitor.
pub struct LivePipeline<M: IoMaster> {
    scheduler: Arc<ActuationScheduler<M>>,
    stop: Arc<AtomicBool>,
    perception: Option<std::thread::JoinHandle<Result<Perceived, SourceError>>>,
    dispatcher: Option<JoinHandle<Dispatched>>,
    monitor: Option<(CancelToken, JoinHandle<()>)>,
    drain: Duration,
}

impl<M: IoMaster> LivePipeline<M> {
    /// Validates that `source` fits `pipeline`, then starts everything.
    /// Must be called from within a tokio runtime.
    pub fn start(
        pipeline: SortingPipeline,
        source: Box<dyn LineSource>,
        scheduler: ActuationScheduler<M>,
        options: LiveOptions,
    ) -> Result<Self, RunError> {
        pipeline.check_source(source.as_ref())?;
        let runtime = Handle::try_current().map_err(|_| {
            ConfigError::Validation("live pipeline must be started inside a tokio runtime".to_string())
        })?;
        let scheduler = Arc::new(scheduler);
        let (queue, mut commands) = mpsc::channel::<EjectionCommand>(scheduler.config().command_queue_depth);

        let monitor_stop = CancelToken::new();
        let monitor = {
            let stop = monitor_stop.clone();
            let mut status = scheduler.subscribe();
            runtime.spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        event = status.recv() => match event {
                            Ok(HardwareStatus::ConnectionLost) => error!("hardware status: connection lost"),
                            Ok(HardwareStatus::EmergencyStop) => warn!("hardware status: emergency stop"),
                            Ok(event) => info!(?event, "hardware status"),
                            Err(RecvError::Lagged(missed)) => warn!(missed, "hardware status events missed"),
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        let dispatcher = {
            let scheduler = Arc::clone(&scheduler);
            runtime.spawn(async move {
                let mut counts = Dispatched::default();
                while let Some(command) = commands.recv().await {
                    match scheduler.schedule(&command) {
                        Ok(()) => counts.dispatched += 1,
                        Err(error) => {
                            counts.rejected += 1;
                            warn!(blob = command.blob_id, %error, "ejection rejected by scheduler");
                        }
                    }
                }
                counts
            })
        };

        let stop = Arc::new(AtomicBool::new(false));
        let perception = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("perception".to_string())
                .spawn(move || perceive(pipeline, source, queue, stop, options))
                .map_err(ConfigError::from)?
        };

        info!(
            queue_depth = scheduler.config().command_queue_depth,
            max_lines = ?options.max_lines,
            "live pipeline started"
        );
        Ok(Self {
            scheduler,
            stop,
            perception: Some(perception),
            dispatcher: Some(dispatcher),
            monitor: Some((monitor_stop, monitor)),
            drain: options.drain,
        })
    }

    pub fn scheduler(&self) -> &ActuationScheduler<M> {
        &self.scheduler
    }

    /// Asks the perception thread to stop after its current line.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Waits for perception to end and the queue to drain, keeps the scheduler
    /// alive for the drain period, then tears everything down.
    pub async fn finish(mut self) -> Result<LiveOutcome, RunError> {
        let (Some(perception), Some(dispatcher)) = (self.perception.take(), self.dispatcher.take()) else {
            return Err(RunError::Task {
                task: "live pipeline",
                reason: "already finished".to_string(),
            });
        };

        let perception = tokio::task::spawn_blocking(move || perception.join());
        let (perceived, dispatched) = futures::future::join(perception, dispatcher).await;

        let perceived = match perceived {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(RunError::Task {
                    task: "perception",
                    reason: "thread panicked".to_string(),
                });
            }
            Err(join) => {
                return Err(RunError::Task {
                    task: "perception",
                    reason: join.to_string(),
                });
            }
        };
        let dispatched = dispatched.map_err(|join| RunError::Task {
            task: "dispatcher",
            reason: join.to_string(),
        })?;

        if !self.drain.is_zero() {
            tokio::time::sleep(self.drain).await;
        }
        self.scheduler.cancel_all();

        if let Some((stop, monitor)) = self.monitor.take() {
            stop.cancel();
            if let Err(join) = monitor.await {
                warn!(%join, "status monitor ended abnormally");
            }
        }

        let stats = perceived.pipeline.stats();
        let summary = LiveSummary {
            lines: stats.lines,
            blobs_closed: stats.blobs_closed,
            commands_planned: stats.commands_planned,
            commands_queued: perceived.queued,
            commands_dropped: perceived.dropped,
            commands_dispatched: dispatched.dispatched,
            commands_rejected: dispatched.rejected,
            rewinds: perceived.rewinds,
        };
        info!(?summary, "live run finished");
        Ok(LiveOutcome {
            pipeline: perceived.pipeline,
            summary,
        })
    }
}

impl<M: IoMaster> Drop for LivePipeline<M> {
    fn drop(&mut self) {
        self.stop();
        if let Some((stop, _)) = &self.monitor {
            stop.cancel();
        }
    }
}
