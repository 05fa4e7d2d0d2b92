//! Destinations for published facts.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::Envelope;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Where the drain task sends facts.
#[async_trait]
pub trait EventSink: Send {
    /// Publish one fact. Errors lose that fact and nothing else.
    async fn publish(&mut self, envelope: &Envelope) -> Result<()>;
}

/// Writes facts to the log under the `events` target.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| Error::SinkUnavailable(e.to_string()))?;
        info!(target: "events", kind = envelope.fact.kind(), "{}", json);
        Ok(())
    }
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Newline-delimited JSON over TCP.
///
/// Connects lazily. While the consumer is unreachable, facts are refused
/// immediately until the next reconnect attempt, which backs off
/// exponentially.
pub struct TcpJsonSink {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    retry_at: Option<Instant>,
    backoff: Duration,
}

impl TcpJsonSink {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            retry_at: None,
            backoff: BACKOFF_INITIAL,
        }
    }

    fn fail(&mut self, reason: String) -> Error {
        self.stream = None;
        self.retry_at = Some(Instant::now() + self.backoff);
        warn!(addr = %self.addr, retry_in = ?self.backoff, "Event sink unavailable: {}", reason);
        self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
        Error::SinkUnavailable(reason)
    }

    async fn connected(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            if let Some(retry_at) = self.retry_at {
                if Instant::now() < retry_at {
                    return Err(Error::SinkUnavailable("waiting to reconnect".into()));
                }
            }
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    info!(addr = %self.addr, "Event sink connected");
                    self.stream = Some(stream);
                    self.retry_at = None;
                    self.backoff = BACKOFF_INITIAL;
                }
                Err(e) => return Err(self.fail(e.to_string())),
            }
        }
        self.stream
            .as_mut()
            .ok_or_else(|| Error::SinkUnavailable("not connected".into()))
    }
}

#[async_trait]
impl EventSink for TcpJsonSink {
    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let mut line = serde_json::to_vec(envelope)
            .map_err(|e| Error::SinkUnavailable(e.to_string()))?;
        line.push(b'\n');

        let stream = self.connected().await?;
        let written = stream.write_all(&line).await;
        written.map_err(|e| self.fail(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventEmitter, Fact};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn envelope() -> Envelope {
        let (emitter, mut rx) = EventEmitter::new(1, "test", "pool-a");
        emitter.emit(Fact::TemplateUpdated {
            generation: 3,
            height: 10,
            prev_hash: "ab".into(),
            clean: false,
            tx_count: 2,
        });
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_sink_writes_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut sink = TcpJsonSink::new(listener.local_addr().unwrap());

        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        });

        sink.publish(&envelope()).await.unwrap();
        sink.publish(&envelope()).await.unwrap();

        let (first, second) = reader.await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(json["kind"], "template_updated");
        assert_eq!(json["data"]["generation"], 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_tcp_sink_backs_off_while_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut sink = TcpJsonSink::new(addr);

        assert!(sink.publish(&envelope()).await.is_err());
        assert!(sink.retry_at.is_some());
        assert_eq!(sink.backoff, BACKOFF_INITIAL * 2);

        // Inside the backoff window the sink refuses without connecting.
        assert!(matches!(
            sink.publish(&envelope()).await,
            Err(Error::SinkUnavailable(reason)) if reason == "waiting to reconnect"
        ));
    }

    #[tokio::test]
    async fn test_log_sink_accepts() {
        LogSink.publish(&envelope()).await.unwrap();
    }
}
