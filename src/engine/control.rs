//! Work-queue processor: claims due entries, routes them to item processors,
//! and converts every failure into persisted entry state.

use chrono::{Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::processor::{self, ItemProcessor, Outcome, ProcessContext};
use super::tier_migrate::TierMigrateProcessor;
use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::model::{QueueEntry, QueueStatus, QueueType};
use crate::retry::{StopSignal, retry_on_deadlock, retry_until_stopped};
use crate::stats::SharedStatistics;
use crate::storage::{Connector, Storage};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// Item processors keyed by the queue type they handle.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<QueueType, Arc<dyn ItemProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every processor this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TierMigrateProcessor);
        registry
    }

    /// Register `processor`, replacing any previous one for its queue type.
    pub fn register(&mut self, processor: impl ItemProcessor + 'static) {
        self.processors
            .insert(processor.queue_type(), Arc::new(processor));
    }

    pub fn get(&self, queue_type: QueueType) -> Option<&Arc<dyn ItemProcessor>> {
        self.processors.get(&queue_type)
    }

    pub fn queue_types(&self) -> Vec<QueueType> {
        self.processors.keys().copied().collect()
    }
}

/// The processor loop.
pub struct WorkQueueProcessor {
    connector: Connector,
    registry: Arc<ProcessorRegistry>,
    settings: Arc<EngineSettings>,
    statistics: SharedStatistics,
    processor_id: String,
    stop: StopSignal,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl WorkQueueProcessor {
    /// Build a processor working against `storage`'s database.
    pub fn new(
        storage: &Storage,
        registry: ProcessorRegistry,
        settings: EngineSettings,
        statistics: SharedStatistics,
        processor_id: impl Into<String>,
    ) -> Self {
        Self {
            connector: storage.connector(),
            registry: Arc::new(registry),
            settings: Arc::new(settings),
            statistics,
            processor_id: processor_id.into(),
            stop: StopSignal::new(),
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Entries currently being processed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Signal the loop to stop. In-flight entries run to completion.
    pub fn shutdown(&self) {
        self.stop.stop();
        self.shutdown.notify_waiters();
    }

    /// Startup recovery: requeue or fail entries this processor left
    /// InProgress, then purge expired entries.
    pub fn recover(&self) -> Result<()> {
        let storage = self.connector.connect()?;
        let now = Utc::now();
        let retry_expiration = now + ChronoDuration::seconds(self.settings.postpone_delay_secs);

        let reset = retry_on_deadlock(&self.settings.deadlock_retry(), || {
            storage.with_transaction(|broker| {
                broker.reset_in_progress(
                    &self.processor_id,
                    now,
                    retry_expiration,
                    self.settings.max_failure_count,
                )
            })
        })?;
        for entry in &reset {
            warn!(
                entry = %entry.id,
                queue_type = %entry.queue_type,
                status = %entry.status,
                failure_count = entry.failure_count,
                "reset entry left in progress"
            );
        }

        self.purge()?;
        Ok(())
    }

    /// Delete terminal entries past their expiration.
    pub fn purge(&self) -> Result<usize> {
        let storage = self.connector.connect()?;
        let purged = retry_on_deadlock(&self.settings.deadlock_retry(), || {
            storage.broker().purge_expired(Utc::now())
        })?;
        if purged > 0 {
            info!(purged, "purged expired queue entries");
        }
        Ok(purged)
    }

    /// Claim and process one due entry. Blocks for the whole operation.
    ///
    /// Returns `None` when nothing is due. Processing failures are recorded on
    /// the entry and reported as [`Outcome::Failed`]; `Err` means the claim
    /// itself could not be made.
    pub fn run_once(&self) -> Result<Option<Outcome>> {
        // Both connections before the claim, so a claimed entry always has
        // somewhere to record its result.
        let storage = self.connector.connect()?;
        let progress = self.connector.connect()?;
        let Some(entry) = retry_on_deadlock(&self.settings.deadlock_retry(), || {
            storage.broker().claim_next(&self.processor_id, Utc::now())
        })?
        else {
            return Ok(None);
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        let outcome = self.dispatch(&storage, &progress, &entry);
        self.active.fetch_sub(1, Ordering::Relaxed);

        Ok(Some(outcome))
    }

    /// Route `entry` to its processor. Never returns an error: anything that
    /// goes wrong ends up as a Failed entry.
    fn dispatch(&self, storage: &Storage, progress: &Storage, entry: &QueueEntry) -> Outcome {
        let span = start_work_span(entry);
        let _enter = span.enter();
        record_state_transition(&span, QueueStatus::Pending, QueueStatus::InProgress);
        let timer = Instant::now();

        let outcome = match self.registry.get(entry.queue_type) {
            None => {
                warn!(queue_type = %entry.queue_type, "no processor for queue type");
                metrics::entries_unroutable()
                    .add(1, &[KeyValue::new("queue_type", entry.queue_type.as_str())]);
                let reason = format!("No processor for work queue type: {}", entry.queue_type);
                self.fail(storage, entry, &reason);
                Outcome::Failed { reason }
            }
            Some(item_processor) => {
                let ctx = ProcessContext {
                    storage,
                    progress,
                    settings: &self.settings,
                    statistics: &self.statistics,
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    processor::process_entry(item_processor.as_ref(), &ctx, entry)
                }));
                match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        error!(entry = %entry.id, error = %e, "unexpected error processing entry");
                        let reason = e.to_string();
                        self.fail(storage, entry, &reason);
                        Outcome::Failed { reason }
                    }
                    Err(payload) => {
                        let reason = format!("processor panicked: {}", panic_message(&*payload));
                        error!(entry = %entry.id, %reason, "item processor panicked");
                        self.fail(storage, entry, &reason);
                        Outcome::Failed { reason }
                    }
                }
            }
        };

        record_state_transition(&span, QueueStatus::InProgress, outcome.status());
        metrics::entries_processed().add(
            1,
            &[
                KeyValue::new("queue_type", entry.queue_type.as_str()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
        metrics::operation_duration_ms().record(
            timer.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "process_entry")],
        );
        outcome
    }

    /// Record a failure, retrying while the database is unavailable.
    fn fail(&self, storage: &Storage, entry: &QueueEntry, reason: &str) {
        let result = retry_until_stopped(&self.stop, self.settings.failure_retry_wait(), || {
            processor::fail_entry(storage, entry, reason, &self.settings)
        });
        if let Err(e) = result {
            error!(entry = %entry.id, error = %e, "could not mark entry failed");
        }
    }

    /// Run until [`shutdown`](Self::shutdown): recover stale entries, then
    /// keep up to `max_concurrent` entries in flight on blocking threads.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let this = Arc::clone(&self);
        tokio::task::spawn_blocking(move || this.recover())
            .await
            .map_err(|e| Error::Other(format!("recovery task failed: {e}")))??;

        let workers = self.settings.max_concurrent.max(1);
        info!(
            processor_id = %self.processor_id,
            workers,
            queue_types = ?self.registry.queue_types(),
            "work queue processor started"
        );

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            tasks.spawn(Arc::clone(&self).worker(worker));
        }

        let purge_every = Duration::from_secs(60);
        let mut last_purge = Instant::now();
        while !self.stop.is_stopped() {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
            if last_purge.elapsed() < purge_every || self.stop.is_stopped() {
                continue;
            }
            last_purge = Instant::now();
            let this = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || this.purge()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("purge error: {e}"),
                Err(e) => warn!("purge task failed: {e}"),
            }
        }

        info!("work queue processor shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("worker task failed: {e}");
            }
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, worker: usize) {
        loop {
            if self.stop.is_stopped() {
                return;
            }

            let this = Arc::clone(&self);
            let processed = match tokio::task::spawn_blocking(move || this.run_once()).await {
                Ok(Ok(Some(_))) => true,
                Ok(Ok(None)) => false,
                Ok(Err(e)) => {
                    error!(worker, "claim error: {e}");
                    false
                }
                Err(e) => {
                    error!(worker, "processing task panicked: {e}");
                    false
                }
            };
            if processed {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
