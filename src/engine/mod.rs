mod compaction;
mod error;
mod mutations;
mod prediction;
mod queries;
mod snapshot;
mod store;
#[cfg(test)]
mod tests;

pub use compaction::compact_events;
pub use error::{EngineError, TelemetryError};
pub use mutations::ReserveRequest;
pub use prediction::{
    DayForecast, Estimate, HourlyForecast, PEAK_HOURS, Prediction, PredictionMethod,
    PredictionQuery, Recommendation, RecommendationLevel, historical_average, recency_average,
    recommend, select_estimate,
};
pub use snapshot::{BucketTotals, SnapshotLog};
pub use store::{SharedSlot, SlotState, SlotStore};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::Clock;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Fold the log in the background. Answered once the compacted file has
    /// replaced the log.
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Fail the next `count` batches holding a record that `matching` accepts.
    #[cfg(test)]
    FailBatches {
        matching: fn(&Event) -> bool,
        count: usize,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Record counts of a finished fold: read, written.
type FoldResult = io::Result<(usize, usize)>;

/// A compaction running off the writer task. Records committed meanwhile are
/// kept in `tail` and appended to the compacted file before the swap.
struct Compaction {
    task: JoinHandle<FoldResult>,
    tail: Vec<Event>,
    waiters: Vec<oneshot::Sender<io::Result<()>>>,
}

struct WalWriter {
    wal: Wal,
    compaction: Option<Compaction>,
    #[cfg(test)]
    fault: Option<(fn(&Event) -> bool, usize)>,
}

/// Owns the WAL. Every append already queued when the writer wakes joins the
/// same batch, and the batch shares one fsync. A control command ends the
/// batch and runs after it, so it observes every append queued before it.
async fn wal_writer_loop(wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut writer = WalWriter {
        wal,
        compaction: None,
        #[cfg(test)]
        fault: None,
    };

    loop {
        let first = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            folded = compaction_done(&mut writer.compaction) => {
                writer.finish_compaction(folded);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = Vec::new();
        let mut control = None;
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    next = rx.try_recv().ok();
                }
                other => control = Some(other),
            }
        }

        if !batch.is_empty() {
            writer.commit_batch(batch);
        }
        if let Some(cmd) = control {
            writer.handle_control(cmd);
        }
    }

    if writer.compaction.is_some() {
        let folded = compaction_done(&mut writer.compaction).await;
        writer.finish_compaction(folded);
    }
}

/// Resolves when the running compaction's fold finishes; never, if none runs.
async fn compaction_done(compaction: &mut Option<Compaction>) -> FoldResult {
    match compaction {
        Some(c) => match (&mut c.task).await {
            Ok(folded) => folded,
            Err(e) => Err(io::Error::other(format!("compaction task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

fn copy_result(result: &io::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
    }
}

impl WalWriter {
    fn commit_batch(&mut self, batch: Vec<PendingAppend>) {
        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = Instant::now();

        let result = batch
            .iter()
            .try_for_each(|(event, _)| self.wal.append_buffered(event))
            .and_then(|()| self.injected_fault(&batch))
            .and_then(|()| self.wal.flush_sync());
        if let Err(e) = &result {
            error!("WAL batch of {} failed: {e}", batch.len());
            if let Err(e) = self.wal.discard_uncommitted() {
                error!("could not roll back failed WAL batch: {e}");
            }
        }

        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if result.is_ok()
            && let Some(c) = &mut self.compaction
        {
            c.tail.extend(batch.iter().map(|(event, _)| event.clone()));
        }
        for (_, tx) in batch {
            let _ = tx.send(copy_result(&result));
        }
    }

    #[cfg(test)]
    fn injected_fault(&mut self, batch: &[PendingAppend]) -> io::Result<()> {
        let Some((matching, count)) = &mut self.fault else {
            return Ok(());
        };
        if *count == 0 || !batch.iter().any(|(event, _)| matching(event)) {
            return Ok(());
        }
        *count -= 1;
        Err(io::Error::other("injected WAL fault"))
    }

    #[cfg(not(test))]
    fn injected_fault(&mut self, _batch: &[PendingAppend]) -> io::Result<()> {
        Ok(())
    }

    fn handle_control(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Compact { response } => self.start_compaction(response),
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            #[cfg(test)]
            WalCommand::FailBatches { matching, count } => self.fault = Some((matching, count)),
            WalCommand::Append { .. } => unreachable!("appends are batched"),
        }
    }

    /// Fold everything committed so far on a blocking thread. A compaction
    /// already running picks up the new waiter instead.
    fn start_compaction(&mut self, response: oneshot::Sender<io::Result<()>>) {
        if let Some(c) = &mut self.compaction {
            c.waiters.push(response);
            return;
        }
        let path = self.wal.path().to_path_buf();
        let len = self.wal.committed_len();
        let task = tokio::task::spawn_blocking(move || {
            let history = Wal::replay_prefix(&path, len)?.events;
            let events = compact_events(&history);
            Wal::write_compact_file(&path, &events)?;
            Ok((history.len(), events.len()))
        });
        self.compaction = Some(Compaction {
            task,
            tail: Vec::new(),
            waiters: vec![response],
        });
    }

    fn finish_compaction(&mut self, folded: FoldResult) {
        let Some(Compaction { tail, waiters, .. }) = self.compaction.take() else {
            return;
        };
        let result = folded.and_then(|(read, written)| {
            Wal::extend_compact_file(self.wal.path(), &tail)?;
            self.wal.swap_compact_file(tail.len() as u64)?;
            info!(
                "WAL compacted: {read} records folded to {written}, {} carried over",
                tail.len()
            );
            Ok(())
        });
        if let Err(e) = &result {
            error!("WAL compaction failed: {e}");
        }
        for tx in waiters {
            let _ = tx.send(copy_result(&result));
        }
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Offset of the lot's local time from UTC. Buckets and "today" use it.
    pub utc_offset_minutes: i32,
    /// Longest a transaction waits for a slot's row lock.
    pub lock_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Engine {
    pub store: SlotStore,
    pub(super) snapshots: RwLock<SnapshotLog>,
    /// Serializes slot creation, so the slot cap and id checks see every
    /// earlier creation.
    pub(super) catalog: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) options: EngineOptions,
}

impl Engine {
    /// Open (or create) the WAL at `wal_path` and rebuild state from it.
    /// Must be called inside a Tokio runtime: it spawns the WAL writer.
    pub fn new(
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: SlotStore::new(),
            snapshots: RwLock::new(SnapshotLog::default()),
            catalog: Mutex::new(()),
            wal_tx,
            clock,
            options,
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // blocking_write would panic here since we may be inside the runtime.
        for event in &events {
            engine.replay_event(event);
        }
        if !events.is_empty() {
            info!(
                "replayed {} events: {} slots, {} bookings",
                events.len(),
                engine.store.len(),
                engine.store.bookings().len()
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::SnapshotRecorded(snapshot) => {
                self.snapshots
                    .try_write()
                    .expect("replay: uncontended write")
                    .push(*snapshot);
            }
            other => self.store.replay_event(other),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// The (hour, weekday) bucket that "now" falls in.
    pub fn current_bucket(&self) -> Bucket {
        Bucket::at(self.now(), self.options.utc_offset_minutes)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL append, then apply. The caller holds the slot's row
    /// lock; if the append fails nothing is applied.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(state, event);
        Ok(())
    }

    /// Make the WAL writer fail the next `count` batches holding a record
    /// that `matching` accepts.
    #[cfg(test)]
    pub(super) async fn fail_wal_batches(&self, matching: fn(&Event) -> bool, count: usize) {
        self.wal_tx
            .send(WalCommand::FailBatches { matching, count })
            .await
            .unwrap();
    }
}
