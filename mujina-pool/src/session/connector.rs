//! Listening sockets and connection setup.
//!
//! The listener a connection arrived on decides its wire protocol. Each
//! accepted connection claims a registry slot up front; when none is free
//! the socket is closed immediately and existing sessions carry on.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{PoolContext, Session, SessionHandle};
use crate::error::Result;
use crate::events::Fact;
use crate::protocol::encrypted::{EncryptedCodec, Responder};
use crate::protocol::plaintext::PlaintextCodec;
use crate::protocol::{FramedTransport, Protocol};
use crate::tracing::prelude::*;

pub struct Connector {
    ctx: Arc<PoolContext>,
    responder: Option<Responder>,
    handshake_timeout: Duration,
    max_line_length: usize,
    max_frame_len: usize,
    tracker: TaskTracker,
}

impl Connector {
    pub fn new(
        ctx: Arc<PoolContext>,
        responder: Option<Responder>,
        handshake_timeout: Duration,
        max_line_length: usize,
        max_frame_len: usize,
    ) -> Self {
        Self {
            ctx,
            responder,
            handshake_timeout,
            max_line_length,
            max_frame_len,
            tracker: TaskTracker::new(),
        }
    }

    /// Session tasks; closed and awaited at shutdown.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Accept connections on `listener` until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, protocol: Protocol, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!(%protocol, %addr, "Listening for miners."),
            Err(e) => warn!(%protocol, error = %e, "Listening on unknown address"),
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(%protocol, error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                trace!(%peer, error = %e, "Could not disable Nagle");
            }
            if let Err(e) = self.accept(stream, peer.to_string(), protocol, cancel.child_token()) {
                warn!(%peer, %protocol, error = %e, "Refusing connection");
            }
        }
        debug!(%protocol, "Listener stopped");
    }

    /// Start a session on an accepted byte stream.
    ///
    /// Fails with `ResourceExhausted` when no session slot is free, in which
    /// case `stream` is dropped.
    pub fn accept<S>(
        self: &Arc<Self>,
        stream: S,
        peer: String,
        protocol: Protocol,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = self.ctx.registry.register(protocol, peer.clone())?;
        debug!(
            session = handle.id(),
            %peer,
            %protocol,
            extranonce1 = %handle.extranonce1(),
            "Connection accepted"
        );
        self.ctx.events.emit(Fact::SessionConnected {
            session: handle.id(),
            protocol,
            peer,
        });

        let this = self.clone();
        self.tracker
            .spawn(async move { this.run_connection(stream, handle, protocol, cancel).await });
        Ok(())
    }

    async fn run_connection<S>(
        self: Arc<Self>,
        mut stream: S,
        handle: SessionHandle,
        protocol: Protocol,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = handle.id();
        let session = Session::new(self.ctx.clone(), handle, protocol);

        if protocol == Protocol::Plaintext {
            let mut transport =
                FramedTransport::new(stream, PlaintextCodec::new(self.max_line_length));
            session.run(&mut transport, cancel).await;
            return;
        }

        let Some(responder) = &self.responder else {
            warn!(session = id, "Encrypted connection without server keys");
            session.finish("no server keys");
            return;
        };
        let handshake = tokio::select! {
            _ = cancel.cancelled() => {
                session.finish("shutdown");
                return;
            }
            result = timeout(self.handshake_timeout, responder.handshake(&mut stream)) => result,
        };
        match handshake {
            Ok(Ok(state)) => {
                let mut transport =
                    FramedTransport::new(stream, EncryptedCodec::new(state, self.max_frame_len));
                session.run(&mut transport, cancel).await;
            }
            Ok(Err(e)) => {
                debug!(session = id, error = %e, "Handshake failed");
                session.finish("handshake failed");
            }
            Err(_) => {
                debug!(session = id, "Handshake timed out");
                session.finish("handshake timeout");
            }
        }
    }
}
