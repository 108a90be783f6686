//! Envelope routing: remote recorder socket or in-process store.
//!
//! The remote sink owns its TCP connection through one writer task;
//! producers reach it over a bounded channel and never block. A full queue
//! or a dead connection drops the envelope - telemetry must not stall the
//! process it watches.

use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use faultline_store_core::EventStore;
use faultline_types::Envelope;
use faultline_wire::FrameCodec;

use crate::CaptureError;

/// Depth of the local send queue; envelopes past it are dropped.
const SEND_QUEUE_DEPTH: usize = 1024;

/// Where captured envelopes go.
#[derive(Clone)]
pub enum Sink {
    /// Connect to a recorder at this address and push frames.
    Remote(String),
    /// Hand envelopes to an in-process store, flushing after each one.
    Store(Arc<dyn EventStore>),
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::Remote(addr) => f.debug_tuple("Remote").field(addr).finish(),
            Sink::Store(_) => f.debug_tuple("Store").finish(),
        }
    }
}

/// Routes envelopes to the configured sink.
#[derive(Debug)]
pub struct Dispatcher {
    sink: Option<Sink>,
    writer: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl Dispatcher {
    /// Build a dispatcher; `None` fails every send with a configuration
    /// error.
    pub fn new(sink: Option<Sink>) -> Self {
        Self {
            sink,
            writer: Mutex::new(None),
        }
    }

    /// Send one envelope.
    ///
    /// Remote sends never block: the envelope is queued for the writer task
    /// and dropped if the queue is full. Store sends are synchronous and
    /// surface store failures to the caller.
    pub async fn send(&self, envelope: Envelope) -> Result<(), CaptureError> {
        match &self.sink {
            None => Err(CaptureError::Configuration),
            Some(Sink::Store(store)) => {
                store
                    .message_received(envelope)
                    .await
                    .map_err(|err| CaptureError::Store(err.to_string()))?;
                store
                    .flush()
                    .await
                    .map_err(|err| CaptureError::Store(err.to_string()))
            }
            Some(Sink::Remote(addr)) => {
                let sender = self.writer_handle(addr).await;
                match sender.try_send(envelope) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("send queue full, dropping envelope");
                        Ok(())
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("writer task gone, dropping envelope");
                        Ok(())
                    }
                }
            }
        }
    }

    /// The live writer handle, spawning the writer task on first use and
    /// again after a connection dies.
    async fn writer_handle(&self, addr: &str) -> mpsc::Sender<Envelope> {
        let mut writer = self.writer.lock().await;
        match writer.as_ref() {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let sender = spawn_writer(addr.to_string());
                *writer = Some(sender.clone());
                sender
            }
        }
    }
}

/// One task owns the socket; nothing else ever touches it.
fn spawn_writer(addr: String) -> mpsc::Sender<Envelope> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(SEND_QUEUE_DEPTH);
    tokio::spawn(async move {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%addr, %err, "recorder unreachable, dropping queued envelopes");
                return;
            }
        };
        let mut framed = FramedWrite::new(stream, FrameCodec);
        while let Some(envelope) = rx.recv().await {
            let body = match faultline_wire::encode(&envelope) {
                Ok(body) => body,
                Err(err) => {
                    warn!(%err, "failed to encode envelope, skipping");
                    continue;
                }
            };
            if let Err(err) = framed.send(Bytes::from(body)).await {
                debug!(%addr, %err, "recorder connection lost");
                break;
            }
        }
    });
    tx
}
