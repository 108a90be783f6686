#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **faultline-recorder** – The ingest side of the Faultline pipeline.
//!
//! A listener task accepts producer connections and forwards their frames
//! into a bounded in-process queue; the recorder loop itself is strictly
//! single-threaded cooperative - one loop, one store session. Frames are
//! polled without blocking, decoded, and folded into the store; the open
//! batch is flushed on a fixed cadence and once more during the
//! signal-driven shutdown drain, so every message the transport already
//! accepted reaches the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use faultline_store_core::EventStore;
use faultline_wire::FrameCodec;

/// How long the open batch may age before a flush, matching the production
/// recorder cadence.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Sleep between polls when the receive queue is empty.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Depth of the local receive queue between the listener and the loop.
const RECV_QUEUE_DEPTH: usize = 1024;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Recorder tuning knobs. The defaults are the production values; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Address the listener binds, e.g. `127.0.0.1:5555`.
    pub bind: String,
    /// Maximum batch age before a periodic flush.
    pub flush_interval: Duration,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
}

impl RecorderConfig {
    /// Production defaults for the given bind address.
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            flush_interval: FLUSH_INTERVAL,
            poll_interval: POLL_INTERVAL,
        }
    }
}

//─────────────────────────────
//  Recorder
//─────────────────────────────

/// The bound recorder: a listening socket plus the store that owns the only
/// database session.
pub struct Recorder {
    config: RecorderConfig,
    store: Arc<dyn EventStore>,
    listener: TcpListener,
}

impl Recorder {
    /// Bind the transport socket and announce the recorder.
    ///
    /// Bind failures are fatal; the supervisor is expected to restart the
    /// process.
    pub async fn bind(config: RecorderConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("failed to bind recorder socket {}", config.bind))?;
        info!(bind = %config.bind, "faultline recorder listening");
        Ok(Self {
            config,
            store,
            listener,
        })
    }

    /// The actual bound address; useful when binding port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until a SIGINT, SIGTERM, or SIGUSR1 arrives, then drain and
    /// flush. Returns the name of the signal that stopped the loop.
    pub async fn run(self) -> Result<String> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let signals = tokio::spawn(listen_for_signals(shutdown_tx));
        let outcome = self.run_with_shutdown(shutdown_rx).await;
        signals.abort();
        outcome
    }

    /// Run until a token arrives on `shutdown`, then drain and flush.
    ///
    /// This is the loop behind [`Recorder::run`], split out so embedders
    /// and tests can drive shutdown without process signals.
    pub async fn run_with_shutdown(
        self,
        mut shutdown: mpsc::Receiver<&'static str>,
    ) -> Result<String> {
        let Self {
            config,
            store,
            listener,
        } = self;
        let (frame_tx, mut frames) = mpsc::channel(RECV_QUEUE_DEPTH);
        let acceptor = tokio::spawn(accept_loop(listener, frame_tx));

        let mut dirty = false;
        let mut last_flush = Instant::now();
        let outcome = loop {
            if let Ok(signal) = shutdown.try_recv() {
                break drain(store.as_ref(), &mut frames, signal).await;
            }
            match frames.try_recv() {
                Ok(frame) => {
                    handle_frame(store.as_ref(), &frame).await;
                    dirty = true;
                }
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(config.poll_interval).await;
                }
                Err(TryRecvError::Disconnected) => {
                    break Err(anyhow!("transport listener died"));
                }
            }
            if dirty && last_flush.elapsed() > config.flush_interval {
                if let Err(err) = store.flush().await {
                    error!(%err, "periodic flush failed, batch rolled back");
                }
                last_flush = Instant::now();
                dirty = false;
            }
        };
        acceptor.abort();
        outcome
    }
}

/// Decode one frame and fold it into the store. Per-message failures are
/// logged and skipped; the store has already rolled back.
async fn handle_frame(store: &dyn EventStore, frame: &[u8]) {
    match faultline_wire::decode(frame) {
        Ok(envelope) => {
            if let Err(err) = store.message_received(envelope).await {
                error!(%err, "store rejected envelope");
            }
        }
        Err(err) => warn!(%err, "dropping undecodable frame"),
    }
}

/// Shutdown path: consume everything already queued, then flush.
async fn drain(
    store: &dyn EventStore,
    frames: &mut mpsc::Receiver<Bytes>,
    signal: &'static str,
) -> Result<String> {
    let mut drained = 0usize;
    while let Ok(frame) = frames.try_recv() {
        handle_frame(store, &frame).await;
        drained += 1;
    }
    store.flush().await?;
    info!(%signal, drained, "finished processing remaining messages, exiting");
    Ok(signal.to_string())
}

//─────────────────────────────
//  Transport fan-in
//─────────────────────────────

async fn accept_loop(listener: TcpListener, frames: mpsc::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "producer connected");
                tokio::spawn(read_connection(stream, frames.clone()));
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Forward one connection's frames into the receive queue. A framing error
/// poisons only this connection; the producer reconnects on its next send.
async fn read_connection(stream: TcpStream, frames: mpsc::Sender<Bytes>) {
    let mut framed = FramedRead::new(stream, FrameCodec);
    while let Some(next) = framed.next().await {
        match next {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "closing producer connection after framing error");
                return;
            }
        }
    }
}

//─────────────────────────────
//  Signals
//─────────────────────────────

/// Post a shutdown token when the process receives a termination signal.
async fn listen_for_signals(shutdown: mpsc::Sender<&'static str>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut user_defined = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to install SIGUSR1 handler");
            return;
        }
    };

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = user_defined.recv() => "SIGUSR1",
    };
    let _ = shutdown.send(name).await;
}
