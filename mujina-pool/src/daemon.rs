//! Daemon lifecycle management for mujina-pool.
//!
//! This module wires the subsystems together from a [`Config`], runs them
//! as tracked tasks, and shuts them down in order on SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{lookup_host, TcpListener};
use tokio::signal::unix::{self, SignalKind};
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::api::{self, ApiState};
use crate::config::{Config, SinkKind, TagSourceKind};
use crate::events::{self, EventEmitter, EventSink, LogSink, TcpJsonSink};
use crate::job::JobManager;
use crate::protocol::encrypted::Responder;
use crate::protocol::Protocol;
use crate::session::{Connector, PoolContext, SessionRegistry, SessionSettings};
use crate::tags::{HttpTags, StaticTags, TagCache, TagSource};
use crate::tracing::prelude::*;
use crate::upstream::BitcoindRpc;
use crate::validator::ShareValidator;
use crate::vardiff::{JsonFileStore, MemoryStore, SnapshotStore};

/// The main daemon that coordinates the pool.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance from a validated configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.config;
        config.validate()?;

        // Events first, so every later subsystem can publish.
        let (events, events_rx) = EventEmitter::new(
            config.events.queue_capacity,
            &config.events.source,
            &config.daemon.instance_id,
        );
        let sink = event_sink(config).await?;
        let drain_cancel = CancellationToken::new();
        let drain = tokio::spawn(events::drain(
            events_rx,
            sink,
            Duration::from_millis(config.events.publish_timeout_ms),
            drain_cancel.clone(),
        ));

        let upstream = &config.upstream;
        let node = BitcoindRpc::new(
            upstream.url.clone(),
            upstream.username.clone(),
            upstream.password.clone(),
            Duration::from_secs(upstream.request_timeout_secs),
        )?;
        let jobs = Arc::new(JobManager::new(config.job_params()?, events.clone(), Arc::new(node)));
        self.tracker.spawn({
            let jobs = jobs.clone();
            let shutdown = self.shutdown.clone();
            async move { jobs.run_upstream(shutdown).await }
        });

        let tags = Arc::new(TagCache::new(
            tag_source(config)?,
            Duration::from_millis(config.tags.request_timeout_ms),
            Duration::from_secs(config.tags.refresh_interval_secs),
        )?);
        self.tracker.spawn({
            let tags = tags.clone();
            let shutdown = self.shutdown.clone();
            async move { tags.run_refresh(shutdown).await }
        });

        let vardiff = config.vardiff_params()?;
        let snapshots: Arc<dyn SnapshotStore> = match &config.vardiff.snapshot_file {
            Some(path) => Arc::new(JsonFileStore::open(path, vardiff.snapshot_ttl)?),
            None => Arc::new(MemoryStore::new(vardiff.snapshot_ttl)),
        };

        let registry = Arc::new(SessionRegistry::new(config.daemon.max_sessions));
        let ctx = Arc::new(PoolContext {
            settings: SessionSettings {
                network: config.network()?,
                pool_tag: config.jobs.pool_tag.clone(),
                authorize_timeout: config.listen.authorize_timeout(),
                idle_check: vardiff.target_interval.as_interval(),
            },
            jobs: jobs.clone(),
            validator: ShareValidator::new(config.validation_params()?),
            vardiff,
            snapshots,
            tags: tags.clone(),
            events: events.clone(),
            registry: registry.clone(),
        });

        let connector = Arc::new(Connector::new(
            ctx,
            responder(config)?,
            config.listen.handshake_timeout(),
            config.listen.max_line_length,
            config.encrypted.max_frame_len,
        ));
        let plaintext = TcpListener::bind(config.listen.plaintext)
            .await
            .with_context(|| format!("failed to bind {}", config.listen.plaintext))?;
        self.tracker.spawn(connector.clone().serve(
            plaintext,
            Protocol::Plaintext,
            self.shutdown.clone(),
        ));
        if let Some(addr) = config.listen.encrypted {
            let encrypted = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            self.tracker.spawn(connector.clone().serve(
                encrypted,
                Protocol::Encrypted,
                self.shutdown.clone(),
            ));
        }

        if !config.api.listen.is_empty() {
            let state = ApiState {
                instance: config.daemon.instance_id.as_str().into(),
                started: Instant::now(),
                registry,
                jobs,
                tags,
                events,
            };
            let addr = config.api.listen.clone();
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                if let Err(e) = api::serve(&addr, state, shutdown).await {
                    error!("API server error: {:#}", e);
                }
            });
        }
        self.tracker.close();

        info!(network = %config.daemon.network, instance = %config.daemon.instance_id, "Started.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();

        // Listeners stop first, then every session finishes and emits its
        // disconnect before the drain is told to flush.
        self.tracker.wait().await;
        connector.tracker().close();
        connector.tracker().wait().await;
        drain_cancel.cancel();
        if let Err(e) = drain.await {
            warn!("Event drain task failed: {}", e);
        }
        info!("Exiting.");

        Ok(())
    }
}

async fn event_sink(config: &Config) -> anyhow::Result<Box<dyn EventSink>> {
    match config.events.sink {
        SinkKind::Log => Ok(Box::new(LogSink)),
        SinkKind::Tcp => {
            let target = config
                .events
                .tcp_addr
                .as_deref()
                .ok_or_else(|| anyhow!("events: tcp sink needs tcp_addr"))?;
            let addr = lookup_host(target)
                .await
                .with_context(|| format!("failed to resolve event sink {}", target))?
                .next()
                .ok_or_else(|| anyhow!("event sink {} resolved to no address", target))?;
            Ok(Box::new(TcpJsonSink::new(addr)))
        }
    }
}

fn tag_source(config: &Config) -> anyhow::Result<Arc<dyn TagSource>> {
    let tags = &config.tags;
    Ok(match tags.source {
        TagSourceKind::Static => Arc::new(StaticTags::new(tags.static_tags.clone())),
        TagSourceKind::Http => {
            let base = tags
                .http_base_url
                .clone()
                .ok_or_else(|| anyhow!("tags: http source needs http_base_url"))?;
            Arc::new(HttpTags::new(base, Duration::from_millis(tags.request_timeout_ms))?)
        }
    })
}

/// Responder for the encrypted listener, if an authority key is configured.
fn responder(config: &Config) -> anyhow::Result<Option<Responder>> {
    let Some(authority) = config.encrypted.authority_key()? else {
        return Ok(None);
    };
    let validity = Duration::from_secs(config.encrypted.certificate_validity_secs);
    let responder = Responder::new(&authority, validity).context("encrypted listener keys")?;
    info!(authority = %responder.authority_public(), "Encrypted listener keys loaded");
    Ok(Some(responder))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHORITY_KEY: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    #[test]
    fn test_no_keys_means_no_responder() {
        let config = Config::default();
        assert!(responder(&config).unwrap().is_none());
    }

    #[test]
    fn test_responder_from_keys() {
        let mut config = Config::default();
        config.encrypted.authority_secret_key = Some(AUTHORITY_KEY.into());
        let responder = responder(&config).unwrap().unwrap();
        let secret = AUTHORITY_KEY.parse().unwrap();
        assert_eq!(
            responder.authority_public(),
            crate::protocol::encrypted::authority_public_key(&secret)
        );
    }

    #[tokio::test]
    async fn test_tcp_sink_needs_address() {
        let mut config = Config::default();
        config.events.sink = SinkKind::Tcp;
        assert!(event_sink(&config).await.is_err());
        config.events.tcp_addr = Some("127.0.0.1:9000".into());
        assert!(event_sink(&config).await.is_ok());
    }

    #[test]
    fn test_http_tags_need_base_url() {
        let mut config = Config::default();
        config.tags.source = TagSourceKind::Http;
        assert!(tag_source(&config).is_err());
        config.tags.http_base_url = Some("http://127.0.0.1:8080/tags".into());
        assert!(tag_source(&config).is_ok());
    }
}
