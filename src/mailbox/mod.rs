//! # Transport Mailbox
//!
//! Buffers inbound encrypted envelopes and outbound frames around an
//! unreliable, reconnecting transport.
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TRANSPORT MAILBOX                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  INBOUND                                                               │
//! │  transport ──► enqueue_inbound ──► [buffer] ──► drain_inbound          │
//! │                                                  │                      │
//! │                      group by inbox address ─────┤                      │
//! │                                                  ▼                      │
//! │             ┌── group A: envelope, envelope ──► handler (sequential)   │
//! │  all groups ┤                                                          │
//! │  concurrent └── group B: envelope           ──► handler                │
//! │                                                                         │
//! │  One failing envelope never blocks its siblings or other groups.      │
//! │  A drain that processed anything raises one throttled notification.   │
//! │                                                                         │
//! │  OUTBOUND                                                              │
//! │  producers ──► enqueue_outbound ──► [buffer] ──► flush_outbound        │
//! │                                                  │ only while the      │
//! │                                                  │ transport is open   │
//! │                                                  ▼                      │
//! │                            on_transport_open: resubscribe FIRST,      │
//! │                            then flush, then drain inbound             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// At most one new-message notification per this window, regardless of how
/// many envelopes arrive.
pub const NOTIFICATION_COOLDOWN_MS: i64 = 5_000;

/// An encrypted envelope as it arrives off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Mailbox/inbox address the envelope was delivered to
    pub inbox_address: String,
    /// Opaque encrypted content
    pub encrypted_content: String,
    /// Delivery timestamp (ms)
    pub timestamp: i64,
}

/// Processes one decrypted-envelope-worth of work.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle a single envelope. Errors are isolated per envelope.
    async fn handle(&self, envelope: &InboundEnvelope) -> Result<()>;
}

/// The unreliable transport underneath the mailbox.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the link is currently open.
    fn is_open(&self) -> bool;
    /// Send one serialized frame.
    async fn send(&self, frame: &str) -> Result<()>;
}

/// Re-establishes server-side subscriptions after a reconnect.
#[async_trait]
pub trait Resubscriber: Send + Sync {
    /// Run the resubscription handshake.
    async fn resubscribe(&self) -> Result<()>;
}

/// Receives the throttled new-messages notification.
pub trait MailboxNotifier: Send + Sync {
    /// Called at most once per cooldown window after a drain that
    /// processed at least one envelope.
    fn notify_new_messages(&self, count: usize);
}

/// Clears a drain guard when a pass unwinds early.
struct Guard<'a>(&'a AtomicBool);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Inbound/outbound buffering around a reconnecting transport.
pub struct TransportMailbox {
    inbound: Mutex<Vec<InboundEnvelope>>,
    outbound: Mutex<Vec<String>>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    resubscriber: RwLock<Option<Arc<dyn Resubscriber>>>,
    notifier: RwLock<Option<Arc<dyn MailboxNotifier>>>,
    // Separate locks so inbound processing never blocks outbound flushing
    inbound_draining: AtomicBool,
    outbound_flushing: AtomicBool,
    last_notification_ms: Mutex<i64>,
}

impl Default for TransportMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportMailbox {
    /// Create an unwired mailbox. Envelopes and frames buffer until the
    /// handler and transport are attached.
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            transport: RwLock::new(None),
            resubscriber: RwLock::new(None),
            notifier: RwLock::new(None),
            inbound_draining: AtomicBool::new(false),
            outbound_flushing: AtomicBool::new(false),
            last_notification_ms: Mutex::new(0),
        }
    }

    /// Attach the message handler.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Attach the transport.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    /// Attach the resubscription handshake.
    pub fn set_resubscriber(&self, resubscriber: Arc<dyn Resubscriber>) {
        *self.resubscriber.write() = Some(resubscriber);
    }

    /// Attach the user-facing notifier.
    pub fn set_notifier(&self, notifier: Arc<dyn MailboxNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// Buffered inbound envelope count.
    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Buffered outbound frame count.
    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Append an envelope as it arrives. Call [`Self::drain_inbound`] to
    /// process.
    pub fn enqueue_inbound(&self, envelope: InboundEnvelope) {
        self.inbound.lock().push(envelope);
    }

    /// Process everything buffered.
    ///
    /// Envelopes are grouped by inbox address; each group runs
    /// sequentially (per-mailbox order holds within a drain), all groups
    /// run concurrently. A failing envelope is logged and skipped — it
    /// must not block its siblings or other groups. Returns the number of
    /// envelopes handed to the handler.
    pub async fn drain_inbound(&self) -> usize {
        let Some(handler) = self.handler.read().clone() else {
            return 0;
        };

        if self.inbound_draining.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _guard = Guard(&self.inbound_draining);

        let buffered: Vec<InboundEnvelope> = std::mem::take(&mut *self.inbound.lock());
        if buffered.is_empty() {
            return 0;
        }
        let total = buffered.len();

        // Group by inbox address, preserving arrival order within a group
        let mut groups: HashMap<String, Vec<InboundEnvelope>> = HashMap::new();
        for envelope in buffered {
            groups.entry(envelope.inbox_address.clone()).or_default().push(envelope);
        }

        let tasks = groups.into_values().map(|group| {
            let handler = handler.clone();
            async move {
                for envelope in group {
                    if let Err(e) = handler.handle(&envelope).await {
                        tracing::error!(
                            "Error processing inbound envelope for {}: {}",
                            envelope.inbox_address,
                            e
                        );
                    }
                }
            }
        });
        futures::future::join_all(tasks).await;

        self.maybe_notify(total);
        total
    }

    /// Raise the user-facing notification unless one fired within the
    /// cooldown window.
    fn maybe_notify(&self, count: usize) {
        if count == 0 {
            return;
        }
        let now = crate::time::now_timestamp_millis();
        {
            let mut last = self.last_notification_ms.lock();
            if now - *last < NOTIFICATION_COOLDOWN_MS {
                return;
            }
            *last = now;
        }
        if let Some(notifier) = self.notifier.read().clone() {
            notifier.notify_new_messages(count);
        }
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Buffer a frame for delivery.
    pub fn enqueue_outbound(&self, frame: String) {
        self.outbound.lock().push(frame);
    }

    /// Buffer a frame and immediately attempt a flush. The flush is a
    /// no-op while the transport is closed, so this never loses work.
    pub async fn send_or_buffer(&self, frame: String) -> Result<()> {
        self.enqueue_outbound(frame);
        self.flush_outbound().await
    }

    /// Send buffered frames, strictly only while the transport reports
    /// open. A closed or reconnecting transport accumulates outbound work
    /// without loss, to be flushed on the next open transition.
    pub async fn flush_outbound(&self) -> Result<()> {
        let Some(transport) = self.transport.read().clone() else {
            return Ok(());
        };

        if self.outbound_flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = Guard(&self.outbound_flushing);

        loop {
            if !transport.is_open() {
                return Ok(());
            }
            let Some(frame) = ({
                let mut outbound = self.outbound.lock();
                if outbound.is_empty() {
                    None
                } else {
                    Some(outbound.remove(0))
                }
            }) else {
                return Ok(());
            };

            if let Err(e) = transport.send(&frame).await {
                // The link dropped mid-flush: put the frame back at the
                // head so nothing is lost, and wait for the next open.
                tracing::warn!("Outbound send failed, re-buffering frame: {}", e);
                self.outbound.lock().insert(0, frame);
                return Ok(());
            }
        }
    }

    /// React to the transport (re)opening: run the resubscription
    /// handshake first, then flush queued frames and process anything that
    /// buffered inbound while the link was down.
    pub async fn on_transport_open(&self) -> Result<()> {
        if let Some(resubscriber) = self.resubscriber.read().clone() {
            resubscriber.resubscribe().await?;
        }
        self.flush_outbound().await?;
        self.drain_inbound().await;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct RecordingTransport {
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTransport {
        fn new(open: bool, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(open),
                sent: Mutex::new(Vec::new()),
                log,
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, frame: &str) -> Result<()> {
            self.sent.lock().push(frame.to_string());
            self.log.lock().push(format!("send:{}", frame));
            Ok(())
        }
    }

    struct RecordingResubscriber {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Resubscriber for RecordingResubscriber {
        async fn resubscribe(&self) -> Result<()> {
            self.log.lock().push("resubscribe".to_string());
            Ok(())
        }
    }

    /// Handler that records processing order and fails on demand.
    struct RecordingHandler {
        processed: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl InboundHandler for RecordingHandler {
        async fn handle(&self, envelope: &InboundEnvelope) -> Result<()> {
            if self.fail_on.as_deref() == Some(envelope.encrypted_content.as_str()) {
                return Err(Error::Internal("scripted failure".into()));
            }
            self.processed.lock().push(envelope.encrypted_content.clone());
            Ok(())
        }
    }

    struct CountingNotifier {
        calls: Mutex<usize>,
    }

    impl MailboxNotifier for CountingNotifier {
        fn notify_new_messages(&self, _count: usize) {
            *self.calls.lock() += 1;
        }
    }

    fn envelope(inbox: &str, content: &str) -> InboundEnvelope {
        InboundEnvelope {
            inbox_address: inbox.to_string(),
            encrypted_content: content.to_string(),
            timestamp: 100,
        }
    }

    #[tokio::test]
    async fn test_outbound_accumulates_while_closed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mailbox = TransportMailbox::new();
        let transport = RecordingTransport::new(false, log);
        mailbox.set_transport(transport.clone());

        mailbox.send_or_buffer("frame-1".into()).await.unwrap();
        mailbox.send_or_buffer("frame-2".into()).await.unwrap();

        // Closed link: nothing sent, nothing lost
        assert!(transport.sent.lock().is_empty());
        assert_eq!(mailbox.outbound_len(), 2);

        transport.open.store(true, Ordering::SeqCst);
        mailbox.flush_outbound().await.unwrap();
        assert_eq!(*transport.sent.lock(), vec!["frame-1", "frame-2"]);
        assert_eq!(mailbox.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_open_transition_resubscribes_before_flushing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mailbox = TransportMailbox::new();
        let transport = RecordingTransport::new(true, log.clone());
        mailbox.set_transport(transport);
        mailbox.set_resubscriber(Arc::new(RecordingResubscriber { log: log.clone() }));

        mailbox.enqueue_outbound("queued-frame".into());
        mailbox.on_transport_open().await.unwrap();

        let recorded = log.lock().clone();
        assert_eq!(recorded, vec!["resubscribe", "send:queued-frame"]);
    }

    #[tokio::test]
    async fn test_inbound_groups_preserve_per_mailbox_order() {
        let mailbox = TransportMailbox::new();
        let processed = Arc::new(Mutex::new(Vec::new()));
        mailbox.set_handler(Arc::new(RecordingHandler {
            processed: processed.clone(),
            fail_on: None,
        }));

        mailbox.enqueue_inbound(envelope("inbox-a", "a1"));
        mailbox.enqueue_inbound(envelope("inbox-b", "b1"));
        mailbox.enqueue_inbound(envelope("inbox-a", "a2"));

        let drained = mailbox.drain_inbound().await;
        assert_eq!(drained, 3);

        let processed = processed.lock().clone();
        assert_eq!(processed.len(), 3);
        let a1 = processed.iter().position(|c| c == "a1").unwrap();
        let a2 = processed.iter().position(|c| c == "a2").unwrap();
        assert!(a1 < a2, "per-mailbox order must hold within a drain");
    }

    #[tokio::test]
    async fn test_failing_envelope_does_not_block_siblings() {
        let mailbox = TransportMailbox::new();
        let processed = Arc::new(Mutex::new(Vec::new()));
        mailbox.set_handler(Arc::new(RecordingHandler {
            processed: processed.clone(),
            fail_on: Some("poison".into()),
        }));

        mailbox.enqueue_inbound(envelope("inbox-a", "poison"));
        mailbox.enqueue_inbound(envelope("inbox-a", "a2"));
        mailbox.enqueue_inbound(envelope("inbox-b", "b1"));

        mailbox.drain_inbound().await;

        let processed = processed.lock().clone();
        assert!(processed.contains(&"a2".to_string()));
        assert!(processed.contains(&"b1".to_string()));
        assert!(!processed.contains(&"poison".to_string()));
    }

    #[tokio::test]
    async fn test_drain_without_handler_buffers() {
        let mailbox = TransportMailbox::new();
        mailbox.enqueue_inbound(envelope("inbox-a", "a1"));

        // No handler yet: the envelope stays buffered
        assert_eq!(mailbox.drain_inbound().await, 0);
        assert_eq!(mailbox.inbound_len(), 1);

        let processed = Arc::new(Mutex::new(Vec::new()));
        mailbox.set_handler(Arc::new(RecordingHandler {
            processed: processed.clone(),
            fail_on: None,
        }));
        assert_eq!(mailbox.drain_inbound().await, 1);
        assert_eq!(processed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_throttled_per_window() {
        let mailbox = TransportMailbox::new();
        let processed = Arc::new(Mutex::new(Vec::new()));
        mailbox.set_handler(Arc::new(RecordingHandler {
            processed,
            fail_on: None,
        }));
        let notifier = Arc::new(CountingNotifier { calls: Mutex::new(0) });
        mailbox.set_notifier(notifier.clone());

        mailbox.enqueue_inbound(envelope("inbox-a", "a1"));
        mailbox.drain_inbound().await;

        // A second drain inside the cooldown stays silent
        mailbox.enqueue_inbound(envelope("inbox-a", "a2"));
        mailbox.drain_inbound().await;

        assert_eq!(*notifier.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_empty_drain_raises_no_notification() {
        let mailbox = TransportMailbox::new();
        let processed = Arc::new(Mutex::new(Vec::new()));
        mailbox.set_handler(Arc::new(RecordingHandler {
            processed,
            fail_on: None,
        }));
        let notifier = Arc::new(CountingNotifier { calls: Mutex::new(0) });
        mailbox.set_notifier(notifier.clone());

        mailbox.drain_inbound().await;
        assert_eq!(*notifier.calls.lock(), 0);
    }
}
