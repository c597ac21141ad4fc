use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use shared::protocol::{ClientRequest, EventKind, ServerEvent};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;

const PUMP_DEPTH: usize = 64;

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disposed,
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel is disposed")]
    Disposed,
    #[error("outbound queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("failed to encode outbound frame: {0}")]
    Encode(String),
}

/// One established duplex connection: frames written to `outbound` go to
/// the backend, frames arriving from it are read off `inbound`. The link
/// is dead once `inbound` yields `None`.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

pub struct MissingChannelTransport;

#[async_trait]
impl ChannelTransport for MissingChannelTransport {
    async fn open(&self, _url: &str) -> Result<TransportLink> {
        Err(anyhow!("channel transport is unavailable"))
    }
}

/// Production transport: a tokio-tungstenite socket pumped into the duplex
/// link by two helper tasks. Both tasks exit when either side closes.
pub struct WebSocketTransport;

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(PUMP_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<String>(PUMP_DEPTH);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct OutboundState {
    pending: VecDeque<String>,
    live: Option<mpsc::Sender<String>>,
}

/// Typed publish/subscribe over one logical backend connection.
///
/// Handlers are keyed by `(EventKind, key)`; registering the same pair twice
/// replaces the previous handler, so a re-registration can never double
/// deliveries. Inbound events are dispatched inline on the reader task, in
/// arrival order per connection.
pub struct EventChannel {
    transport: Arc<dyn ChannelTransport>,
    url: String,
    config: ChannelConfig,
    handlers: Mutex<HashMap<EventKind, Vec<(String, EventHandler)>>>,
    outbound: Mutex<OutboundState>,
    status: Mutex<ChannelStatus>,
    status_tx: broadcast::Sender<ChannelStatus>,
    decode_failures: broadcast::Sender<String>,
    started: AtomicBool,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    pub fn new(
        url: impl Into<String>,
        config: ChannelConfig,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(64);
        let (decode_failures, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            url: url.into(),
            config,
            handlers: Mutex::new(HashMap::new()),
            outbound: Mutex::new(OutboundState {
                pending: VecDeque::new(),
                live: None,
            }),
            status: Mutex::new(ChannelStatus::Idle),
            status_tx,
            decode_failures,
            started: AtomicBool::new(false),
            run_task: Mutex::new(None),
        })
    }

    pub fn on(&self, kind: EventKind, key: impl Into<String>, handler: EventHandler) {
        let key = key.into();
        let mut handlers = self.handlers.lock();
        let registered = handlers.entry(kind).or_default();
        if let Some(slot) = registered.iter_mut().find(|(existing, _)| *existing == key) {
            debug!("channel: replacing handler kind={kind:?} key={key}");
            slot.1 = handler;
        } else {
            registered.push((key, handler));
        }
    }

    pub fn off(&self, kind: EventKind, key: &str) {
        let mut handlers = self.handlers.lock();
        if let Some(registered) = handlers.get_mut(&kind) {
            registered.retain(|(existing, _)| existing != key);
        }
    }

    /// Enqueue one outbound request. Before the transport is established the
    /// frame is held on a bounded queue and flushed on connect; on a full
    /// queue or a disposed channel this fails fast instead of blocking.
    pub fn send(&self, request: &ClientRequest) -> Result<(), ChannelError> {
        if *self.status.lock() == ChannelStatus::Disposed {
            return Err(ChannelError::Disposed);
        }
        let frame =
            serde_json::to_string(request).map_err(|err| ChannelError::Encode(err.to_string()))?;

        let mut outbound = self.outbound.lock();
        if let Some(live) = &outbound.live {
            match live.try_send(frame) {
                Ok(()) => {
                    debug!("channel: sent {}", request.name());
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Err(ChannelError::QueueFull {
                        capacity: PUMP_DEPTH,
                    });
                }
                Err(mpsc::error::TrySendError::Closed(frame)) => {
                    // Transport died under us; fall back to queueing for the
                    // next connection.
                    outbound.live = None;
                    outbound.pending.push_back(frame);
                }
            }
        } else {
            if outbound.pending.len() >= self.config.outbound_queue {
                return Err(ChannelError::QueueFull {
                    capacity: self.config.outbound_queue,
                });
            }
            outbound.pending.push_back(frame);
        }
        debug!("channel: queued {} until connect", request.name());
        Ok(())
    }

    /// Start the run loop. Idempotent: a second call is a no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("channel: already started");
            return;
        }
        let channel = Arc::clone(self);
        let task = tokio::spawn(async move {
            channel.run_loop().await;
        });
        *self.run_task.lock() = Some(task);
    }

    async fn run_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        self.set_status(ChannelStatus::Connecting);
        loop {
            if self.is_disposed() {
                return;
            }
            match self.transport.open(&self.url).await {
                Ok(link) => {
                    attempt = 0;
                    self.install_link(link.outbound);
                    self.set_status(ChannelStatus::Connected);
                    info!("channel: connected url={}", self.url);
                    self.read_until_closed(link.inbound).await;
                    self.drop_queued_on_loss();
                    if self.is_disposed() {
                        return;
                    }
                    info!("channel: transport closed");
                }
                Err(err) => {
                    warn!("channel: connect failed: {err:#}");
                }
            }
            attempt = attempt.saturating_add(1);
            self.set_status(ChannelStatus::Reconnecting { attempt });
            tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
        }
    }

    async fn read_until_closed(&self, mut inbound: mpsc::Receiver<String>) {
        while let Some(frame) = inbound.recv().await {
            match serde_json::from_str::<ServerEvent>(&frame) {
                Ok(event) => self.dispatch(&event),
                Err(err) => {
                    warn!("channel: failed to decode inbound frame: {err}");
                    let _ = self.decode_failures.send(err.to_string());
                }
            }
        }
    }

    fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = {
            let registered = self.handlers.lock();
            registered
                .get(&kind)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            debug!("channel: no handler for {kind:?}");
            return;
        }
        for handler in handlers {
            handler(event);
        }
    }

    fn install_link(&self, sender: mpsc::Sender<String>) {
        let mut outbound = self.outbound.lock();
        let mut dropped = 0usize;
        while let Some(frame) = outbound.pending.pop_front() {
            if sender.try_send(frame).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("channel: dropped {dropped} queued frames while flushing");
        }
        outbound.live = Some(sender);
    }

    fn drop_queued_on_loss(&self) {
        let mut outbound = self.outbound.lock();
        outbound.live = None;
        let dropped = outbound.pending.len();
        outbound.pending.clear();
        if dropped > 0 {
            warn!("channel: dropped {dropped} queued frames on transport loss");
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.lock().clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_decode_failures(&self) -> broadcast::Receiver<String> {
        self.decode_failures.subscribe()
    }

    pub fn dispose(&self) {
        self.set_status(ChannelStatus::Disposed);
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
        let mut outbound = self.outbound.lock();
        outbound.live = None;
        outbound.pending.clear();
    }

    fn is_disposed(&self) -> bool {
        *self.status.lock() == ChannelStatus::Disposed
    }

    fn set_status(&self, status: ChannelStatus) {
        let mut guard = self.status.lock();
        if *guard == ChannelStatus::Disposed || *guard == status {
            return;
        }
        *guard = status.clone();
        drop(guard);
        let _ = self.status_tx.send(status);
    }
}

fn backoff_delay(config: &ChannelConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(exponent));
    delay.min(config.backoff_cap)
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
