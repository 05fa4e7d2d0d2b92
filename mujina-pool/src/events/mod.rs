//! Lifecycle and telemetry facts for external consumers.
//!
//! Sessions and the job manager call [`EventEmitter::emit`] on the hot path.
//! It never blocks and never fails: facts go into a bounded channel and are
//! dropped (and counted) when the channel is full or the drain task is
//! gone. [`drain`] forwards queued facts to an [`EventSink`], bounding each
//! publish with a timeout.

mod sink;

pub use sink::{EventSink, LogSink, TcpJsonSink};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::job::JobSource;
use crate::protocol::Protocol;
use crate::tracing::prelude::*;

/// Per-session totals reported at disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duration_secs: f64,
    pub final_difficulty: f64,
    pub best_difficulty: f64,
    /// Whether any accepted share rolled the version field
    pub version_rolling: bool,
}

/// Something that happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Fact {
    SessionConnected {
        session: u64,
        protocol: Protocol,
        peer: String,
    },
    SessionDisconnected {
        session: u64,
        identity: Option<String>,
        stats: SessionStats,
    },
    ShareOutcome {
        session: u64,
        identity: String,
        generation: u64,
        outcome: &'static str,
        /// Rejection reason; absent for accepted shares
        reason: Option<&'static str>,
        assigned_difficulty: f64,
        share_difficulty: Option<f64>,
        /// The share's version differs from the job's
        version_rolling: bool,
    },
    DifficultyChanged {
        session: u64,
        identity: Option<String>,
        old: f64,
        new: f64,
        reason: &'static str,
    },
    BlockSolved {
        session: u64,
        identity: String,
        generation: u64,
        source: JobSource,
        hash: String,
        height: u32,
    },
    TemplateNegotiated {
        session: u64,
        token: u64,
        accepted: bool,
        reason: Option<&'static str>,
        tx_count: usize,
        fee_total: u64,
    },
    TemplateUpdated {
        generation: u64,
        height: u32,
        prev_hash: String,
        clean: bool,
        tx_count: usize,
    },
}

impl Fact {
    pub fn kind(&self) -> &'static str {
        match self {
            Fact::SessionConnected { .. } => "session_connected",
            Fact::SessionDisconnected { .. } => "session_disconnected",
            Fact::ShareOutcome { .. } => "share_outcome",
            Fact::DifficultyChanged { .. } => "difficulty_changed",
            Fact::BlockSolved { .. } => "block_solved",
            Fact::TemplateNegotiated { .. } => "template_negotiated",
            Fact::TemplateUpdated { .. } => "template_updated",
        }
    }
}

/// A fact with its publication metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
    pub source: Arc<str>,
    pub instance: Arc<str>,
    #[serde(flatten)]
    pub fact: Fact,
}

/// Cloneable, non-blocking handle for publishing facts.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
    source: Arc<str>,
    instance: Arc<str>,
}

impl EventEmitter {
    /// Create an emitter and the receiving end for [`drain`].
    pub fn new(
        capacity: usize,
        source: &str,
        instance: &str,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            source: source.into(),
            instance: instance.into(),
        };
        (emitter, rx)
    }

    /// An emitter whose facts go nowhere.
    pub fn disabled() -> Self {
        let (emitter, _rx) = Self::new(1, "disabled", "disabled");
        emitter
    }

    /// Queue a fact for publication, dropping it if the queue is full.
    pub fn emit(&self, fact: Fact) {
        let envelope = Envelope {
            timestamp_ms: unix_millis(),
            source: self.source.clone(),
            instance: self.instance.clone(),
            fact,
        };
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => self.record_drop(envelope.fact.kind(), "full"),
            Err(TrySendError::Closed(envelope)) => {
                self.record_drop(envelope.fact.kind(), "closed")
            }
        }
    }

    /// Facts dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, kind: &'static str, why: &'static str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        // Log the 1st, 2nd, 4th, 8th... drop to keep a full queue from
        // flooding the log.
        if total.is_power_of_two() {
            warn!(kind, queue = why, dropped = total, "Event dropped");
        } else {
            trace!(kind, queue = why, dropped = total, "Event dropped");
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Forward queued facts to `sink` until cancelled or every emitter is gone.
///
/// A publish that fails or exceeds `publish_timeout` loses that fact only.
pub async fn drain(
    mut rx: mpsc::Receiver<Envelope>,
    mut sink: Box<dyn EventSink>,
    publish_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        publish_one(sink.as_mut(), &envelope, publish_timeout).await;
    }

    // Flush what is already queued so shutdown facts are not lost.
    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        publish_one(sink.as_mut(), &envelope, publish_timeout).await;
    }
    debug!("Event drain stopped");
}

async fn publish_one(sink: &mut dyn EventSink, envelope: &Envelope, publish_timeout: Duration) {
    match timeout(publish_timeout, sink.publish(envelope)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(kind = envelope.fact.kind(), error = %e, "Event not published"),
        Err(_) => debug!(kind = envelope.fact.kind(), "Event publish timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    fn updated(generation: u64) -> Fact {
        Fact::TemplateUpdated {
            generation,
            height: 100,
            prev_hash: "00".into(),
            clean: true,
            tx_count: 0,
        }
    }

    #[test]
    fn test_emit_never_blocks_when_full() {
        let (emitter, mut rx) = EventEmitter::new(2, "test", "pool-a");
        for generation in 0..10 {
            emitter.emit(updated(generation));
        }
        assert_eq!(emitter.dropped(), 8);
        assert_eq!(rx.try_recv().unwrap().fact, updated(0));
        assert_eq!(rx.try_recv().unwrap().fact, updated(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_after_receiver_gone() {
        let emitter = EventEmitter::disabled();
        emitter.emit(updated(1));
        emitter.emit(updated(2));
        assert_eq!(emitter.dropped(), 2);
    }

    #[test]
    fn test_envelope_json_shape() {
        let (emitter, mut rx) = EventEmitter::new(4, "mujina-pool", "pool-a");
        emitter.emit(Fact::DifficultyChanged {
            session: 7,
            identity: Some("bc1qexample.rig1".into()),
            old: 1.0,
            new: 2.0,
            reason: "fast_ramp",
        });
        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["kind"], "difficulty_changed");
        assert_eq!(json["source"], "mujina-pool");
        assert_eq!(json["instance"], "pool-a");
        assert_eq!(json["data"]["reason"], "fast_ramp");
        assert!(json["timestamp_ms"].as_u64().unwrap() > 0);
    }

    struct StuckSink;

    #[async_trait]
    impl EventSink for StuckSink {
        async fn publish(&mut self, _envelope: &Envelope) -> Result<()> {
            std::future::pending::<()>().await;
            Err(Error::SinkUnavailable("unreachable".into()))
        }
    }

    struct CollectSink(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl EventSink for CollectSink {
        async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
            self.0
                .send(envelope.clone())
                .map_err(|_| Error::SinkUnavailable("closed".into()))
        }
    }

    #[tokio::test]
    async fn test_drain_forwards_in_order() {
        let (emitter, rx) = EventEmitter::new(16, "test", "pool-a");
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain(
            rx,
            Box::new(CollectSink(out_tx)),
            Duration::from_secs(1),
            cancel.clone(),
        ));

        emitter.emit(updated(1));
        emitter.emit(updated(2));
        assert_eq!(out_rx.recv().await.unwrap().fact, updated(1));
        assert_eq!(out_rx.recv().await.unwrap().fact, updated(2));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sink_does_not_stall_emitters() {
        let (emitter, rx) = EventEmitter::new(1, "test", "pool-a");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain(
            rx,
            Box::new(StuckSink),
            Duration::from_millis(100),
            cancel.clone(),
        ));

        // The drain task holds at most one fact in a stuck publish; the rest
        // are dropped without blocking.
        for generation in 0..100 {
            emitter.emit(updated(generation));
        }
        assert!(emitter.dropped() >= 98);

        cancel.cancel();
        task.await.unwrap();
    }
}
