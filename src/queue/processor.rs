//! # Queue Processor
//!
//! Drains pending tasks through registered handlers, gated by connectivity.
//!
//! ## Online Gate
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ONLINE GATE                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  transport_connected      authoritative for abrupt link loss           │
//! │        AND                (Wi-Fi drop closes the socket fast)           │
//! │  host_reports_online      authoritative for explicit transitions       │
//! │                           (airplane mode), lags on silent disconnects   │
//! │                                                                         │
//! │  Neither signal alone is reliable; the queue drains only while both    │
//! │  agree the network is there.                                           │
//! │                                                                         │
//! │  Drain triggers:                                                       │
//! │    1. transition into the online state                                 │
//! │    2. the periodic tick                                                │
//! │    3. queue-updated notifications (enqueues)                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The drain loop is non-reentrant: an atomic in-progress guard prevents
//! two concurrent drains from double-claiming tasks. Handler errors are
//! recorded on the task and never crash the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{ActionQueue, HandlerRegistry, QueueStats, QueueTask, TaskStatus};
use crate::error::{Error, Result};

/// Tick period of the periodic drain trigger.
const TICK_INTERVAL_MS: u64 = 1_000;

/// Offline-indicator data for the UI: shown while the gate is closed,
/// annotated with how much work is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineStatus {
    /// Whether the gate is currently open
    pub online: bool,
    /// Tasks waiting to drain
    pub pending_tasks: usize,
}

/// Clears the drain guard when a pass unwinds early.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the action queue through registered handlers while online.
pub struct QueueProcessor {
    queue: Arc<ActionQueue>,
    handlers: HandlerRegistry,
    transport_connected: AtomicBool,
    host_online: AtomicBool,
    draining: AtomicBool,
    wake: Notify,
}

impl QueueProcessor {
    /// Create a processor over an engine with a fully wired registry.
    pub fn new(queue: Arc<ActionQueue>, handlers: HandlerRegistry) -> Self {
        Self {
            queue,
            handlers,
            transport_connected: AtomicBool::new(false),
            // Hosts rarely report offline at startup; assume online until
            // told otherwise, the transport signal still gates draining.
            host_online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// The gate: both signals must agree.
    pub fn is_online(&self) -> bool {
        self.transport_connected.load(Ordering::SeqCst) && self.host_online.load(Ordering::SeqCst)
    }

    /// Record transport-level connectivity (socket open/closed).
    pub fn set_transport_connected(&self, connected: bool) {
        let was_online = self.is_online();
        self.transport_connected.store(connected, Ordering::SeqCst);
        if !was_online && self.is_online() {
            tracing::info!("Online (transport connected); waking queue processor");
            self.wake.notify_one();
        }
    }

    /// Record the host-reported network state (airplane mode, interface
    /// changes). Known to lag on silent disconnects, which is why the
    /// transport signal is required too.
    pub fn set_host_online(&self, online: bool) {
        let was_online = self.is_online();
        self.host_online.store(online, Ordering::SeqCst);
        if !was_online && self.is_online() {
            tracing::info!("Online (host network up); waking queue processor");
            self.wake.notify_one();
        }
    }

    /// Offline-indicator data for the UI.
    pub fn status(&self) -> Result<OfflineStatus> {
        let stats = self.queue.get_stats()?;
        Ok(OfflineStatus {
            online: self.is_online(),
            pending_tasks: stats.pending,
        })
    }

    /// Counts per status, for observers.
    pub fn stats(&self) -> Result<QueueStats> {
        self.queue.get_stats()
    }

    /// Run the processor until the task is aborted.
    ///
    /// Repairs crash-abandoned tasks once, then reacts to enqueue
    /// notifications, online transitions and the periodic tick.
    pub async fn run(self: Arc<Self>) {
        match self.queue.reset_stuck_tasks() {
            Ok(0) => {}
            Ok(reset) => tracing::info!("Reset {} stuck task(s) on startup", reset),
            Err(e) => tracing::warn!("Stuck-task recovery failed: {}", e),
        }

        let updates = self.queue.updates();
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(TICK_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = updates.notified() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.process_queue().await {
                tracing::warn!("Queue drain failed: {}", e);
            }
        }
    }

    /// One drain pass. Public so hosts can trigger it directly on
    /// queue-updated events.
    pub async fn process_queue(&self) -> Result<()> {
        if !self.is_online() {
            return Ok(());
        }

        // Non-reentrant: a second caller backs off instead of
        // double-claiming tasks.
        if self.draining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = DrainGuard(&self.draining);

        let now = crate::time::now_timestamp_millis();
        let batch = self
            .queue
            .database()
            .get_queue_tasks_by_status(TaskStatus::Pending, self.queue.config().batch_size)?;
        let ready: Vec<QueueTask> = batch.into_iter().filter(|t| t.next_retry_at <= now).collect();

        for task in ready {
            self.process_task(task).await;
        }

        Ok(())
    }

    /// Execute one task. All failure modes land on the task row; nothing
    /// escapes to the drain loop.
    async fn process_task(&self, task: QueueTask) {
        let database = self.queue.database();

        // Re-fetch to claim: another drain (or an explicit trigger) may
        // have taken it between the batch read and now.
        let fresh = match database.get_queue_task(task.id) {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to re-read task {}: {}", task.id, e);
                return;
            }
        };
        if fresh.status != TaskStatus::Pending {
            return;
        }
        let mut task = fresh;

        let Some(handler) = self.handlers.get(task.task_type) else {
            task.status = TaskStatus::Failed;
            task.error = Some(Error::HandlerNotRegistered(task.task_type.as_str().into()).to_string());
            task.processed_at = Some(crate::time::now_timestamp_millis());
            if let Err(e) = database.update_queue_task(&task) {
                tracing::warn!("Failed to fail task {}: {}", task.id, e);
            }
            return;
        };

        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(crate::time::now_timestamp_millis());
        if let Err(e) = database.update_queue_task(&task) {
            tracing::warn!("Failed to claim task {}: {}", task.id, e);
            return;
        }

        match handler.execute(&task.payload).await {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                task.processed_at = Some(crate::time::now_timestamp_millis());
                task.processing_started_at = None;
                task.error = None;
            }
            Err(e) => {
                let permanent = handler.is_permanent_error(&e);
                let retries_spent = task.retry_count + 1 >= task.max_retries;

                if permanent || retries_spent {
                    tracing::warn!(
                        "Task {} ({}) failed permanently: {}",
                        task.id,
                        task.task_type.as_str(),
                        e
                    );
                    task.status = TaskStatus::Failed;
                    task.error = Some(if permanent {
                        e.to_string()
                    } else {
                        format!("Max retries exceeded: {}", e)
                    });
                    task.processed_at = Some(crate::time::now_timestamp_millis());
                } else {
                    task.retry_count += 1;
                    task.status = TaskStatus::Pending;
                    task.next_retry_at = crate::time::now_timestamp_millis()
                        + self.queue.backoff_delay_ms(task.retry_count);
                    task.error = Some(e.to_string());
                    tracing::debug!(
                        "Task {} ({}) retrying (attempt {}): {}",
                        task.id,
                        task.task_type.as_str(),
                        task.retry_count,
                        e
                    );
                }
                task.processing_started_at = None;
            }
        }

        if let Err(e) = database.update_queue_task(&task) {
            tracing::warn!("Failed to record outcome for task {}: {}", task.id, e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOutcome, TaskHandler, TaskPayload, TaskType};
    use crate::storage::Database;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted handler: pops one result per execution.
    struct ScriptedHandler {
        outcomes: Mutex<Vec<Result<()>>>,
        executions: Mutex<usize>,
        permanent: bool,
    }

    impl ScriptedHandler {
        fn new(outcomes: Vec<Result<()>>, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                executions: Mutex::new(0),
                permanent,
            })
        }

        fn executions(&self) -> usize {
            *self.executions.lock()
        }
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn execute(&self, _payload: &TaskPayload) -> Result<()> {
            *self.executions.lock() += 1;
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }

        fn is_permanent_error(&self, _error: &Error) -> bool {
            self.permanent
        }
    }

    async fn fixture(handler: Arc<ScriptedHandler>) -> (Arc<ActionQueue>, Arc<QueueProcessor>) {
        let db = Arc::new(Database::open(None).await.unwrap());
        let queue = Arc::new(ActionQueue::new(db));
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::SaveConfig, handler);
        let processor = Arc::new(QueueProcessor::new(queue.clone(), registry));
        processor.set_transport_connected(true);
        processor.set_host_online(true);
        (queue, processor)
    }

    fn payload() -> TaskPayload {
        TaskPayload::SaveConfig { address: "addr".into() }
    }

    #[tokio::test]
    async fn test_successful_task_completes() {
        let handler = ScriptedHandler::new(vec![Ok(())], false);
        let (queue, processor) = fixture(handler.clone()).await;

        let id = queue.enqueue(payload(), "k1").unwrap().task_id().unwrap();
        processor.process_queue().await.unwrap();

        let task = queue.database().get_queue_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.processed_at.is_some());
        assert!(task.processing_started_at.is_none());
        assert_eq!(handler.executions(), 1);
    }

    #[tokio::test]
    async fn test_offline_gate_blocks_drain() {
        let handler = ScriptedHandler::new(vec![Ok(())], false);
        let (queue, processor) = fixture(handler.clone()).await;
        processor.set_host_online(false);

        queue.enqueue(payload(), "k1").unwrap();
        processor.process_queue().await.unwrap();
        assert_eq!(handler.executions(), 0);

        // Host back, but transport down: still gated
        processor.set_host_online(true);
        processor.set_transport_connected(false);
        processor.process_queue().await.unwrap();
        assert_eq!(handler.executions(), 0);

        // Both signals up: drains
        processor.set_transport_connected(true);
        processor.process_queue().await.unwrap();
        assert_eq!(handler.executions(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let handler =
            ScriptedHandler::new(vec![Err(Error::TransportError("flaky".into()))], false);
        let (queue, processor) = fixture(handler.clone()).await;

        let id = queue.enqueue(payload(), "k1").unwrap().task_id().unwrap();
        processor.process_queue().await.unwrap();

        let task = queue.database().get_queue_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.next_retry_at > crate::time::now_timestamp_millis());
        assert!(task.error.as_ref().unwrap().contains("flaky"));

        // Not due yet: a second drain leaves it untouched
        processor.process_queue().await.unwrap();
        assert_eq!(handler.executions(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_immediately() {
        let handler =
            ScriptedHandler::new(vec![Err(Error::StorageNotFound("gone".into()))], true);
        let (queue, processor) = fixture(handler.clone()).await;

        let id = queue.enqueue(payload(), "k1").unwrap().task_id().unwrap();
        processor.process_queue().await.unwrap();

        let task = queue.database().get_queue_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.processed_at.is_some());
        assert_eq!(handler.executions(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let handler = ScriptedHandler::new(
            vec![
                Err(Error::TransportError("1".into())),
                Err(Error::TransportError("2".into())),
                Err(Error::TransportError("3".into())),
            ],
            false,
        );
        let (queue, processor) = fixture(handler.clone()).await;

        let id = queue.enqueue(payload(), "k1").unwrap().task_id().unwrap();

        for _ in 0..3 {
            // Pull the retry time forward so each drain is due
            let mut task = queue.database().get_queue_task(id).unwrap().unwrap();
            task.next_retry_at = 0;
            queue.database().update_queue_task(&task).unwrap();
            processor.process_queue().await.unwrap();
        }

        let task = queue.database().get_queue_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_ref().unwrap().contains("Max retries exceeded"));
        assert_eq!(handler.executions(), 3);
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_task() {
        let db = Arc::new(Database::open(None).await.unwrap());
        let queue = Arc::new(ActionQueue::new(db));
        let processor = Arc::new(QueueProcessor::new(queue.clone(), HandlerRegistry::new()));
        processor.set_transport_connected(true);

        let id = queue.enqueue(payload(), "k1").unwrap().task_id().unwrap();
        processor.process_queue().await.unwrap();

        let task = queue.database().get_queue_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_ref().unwrap().contains("save-config"));
    }

    #[tokio::test]
    async fn test_status_reports_pending_count() {
        let handler = ScriptedHandler::new(vec![], false);
        let (queue, processor) = fixture(handler).await;
        processor.set_transport_connected(false);

        queue.enqueue(payload(), "k1").unwrap();
        queue.enqueue(payload(), "k2").unwrap();

        let status = processor.status().unwrap();
        assert!(!status.online);
        assert_eq!(status.pending_tasks, 2);
    }

    #[tokio::test]
    async fn test_processing_task_is_not_reclaimed_by_drain() {
        let handler = ScriptedHandler::new(vec![], false);
        let (queue, processor) = fixture(handler.clone()).await;

        let id = queue.enqueue(payload(), "k1").unwrap().task_id().unwrap();

        // Simulate another drain having claimed the task already
        let mut task = queue.database().get_queue_task(id).unwrap().unwrap();
        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(crate::time::now_timestamp_millis());
        queue.database().update_queue_task(&task).unwrap();

        processor.process_queue().await.unwrap();
        assert_eq!(handler.executions(), 0);
    }
}
