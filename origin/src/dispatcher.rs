//! Command dispatcher
//!
//! Builds command envelopes, hands them to the writer task and remembers
//! which correlation id belongs to which command.

use crate::error::{OriginError, OriginResult};
use crate::protocol::{CommandEnvelope, FIRST_SEQUENCE_ID};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

/// Bounded record of commands awaiting a response
#[derive(Debug)]
pub struct PendingCommands {
    capacity: usize,
    entries: VecDeque<(u32, String)>,
}

impl PendingCommands {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Record a sent command, evicting the oldest entry when full
    pub fn record(&mut self, sequence_id: u32, command: &str) {
        if self.entries.len() >= self.capacity {
            if let Some((evicted, name)) = self.entries.pop_front() {
                debug!("Pending command {} ({}) evicted without response", evicted, name);
            }
        }
        self.entries.push_back((sequence_id, command.to_string()));
    }

    /// Remove and return the command name for a correlation id
    pub fn resolve(&mut self, sequence_id: u32) -> Option<String> {
        let pos = self.entries.iter().position(|(id, _)| *id == sequence_id)?;
        self.entries.remove(pos).map(|(_, name)| name)
    }

    pub fn get(&self, sequence_id: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(id, _)| *id == sequence_id)
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Sends commands over the attached transport
#[derive(Debug)]
pub struct Dispatcher {
    next_sequence_id: AtomicU32,
    pending: Mutex<PendingCommands>,
    outbound: RwLock<Option<mpsc::Sender<Message>>>,
    connected: AtomicBool,
}

impl Dispatcher {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            next_sequence_id: AtomicU32::new(FIRST_SEQUENCE_ID),
            pending: Mutex::new(PendingCommands::new(pending_capacity)),
            outbound: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Transport-level connection state
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Attach the writer channel of a freshly opened socket
    pub(crate) async fn attach(&self, tx: mpsc::Sender<Message>) {
        *self.outbound.write().await = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Drop the writer channel. Returns true if a transport was attached.
    pub(crate) async fn detach(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
        self.outbound.write().await.take().is_some()
    }

    async fn sender(&self) -> OriginResult<mpsc::Sender<Message>> {
        if !self.is_connected() {
            return Err(OriginError::NotConnected);
        }
        self.outbound
            .read()
            .await
            .clone()
            .ok_or(OriginError::NotConnected)
    }

    /// Send a command and return its correlation id.
    ///
    /// Nothing is transmitted and no id is consumed when the transport is down.
    pub async fn send_command(
        &self,
        command: &str,
        destination: &str,
        params: Value,
    ) -> OriginResult<u32> {
        let tx = self.sender().await?;

        let sequence_id = self.next_sequence_id.fetch_add(1, Ordering::SeqCst);
        let text = CommandEnvelope::new(command, destination, sequence_id, params)?.to_json()?;

        // Recorded before sending so a fast response always finds its entry
        self.pending.lock().await.record(sequence_id, command);

        if let Err(e) = tx.send(Message::Text(text)).await {
            self.pending.lock().await.resolve(sequence_id);
            return Err(OriginError::ChannelClosed(format!(
                "Failed to send {} to {}: {}. The connection may have been lost.",
                command, destination, e
            )));
        }

        debug!("Sent command {} to {} (SequenceID {})", command, destination, sequence_id);
        Ok(sequence_id)
    }

    /// Send a keep-alive ping with an opaque payload
    pub(crate) async fn send_ping(&self, payload: Vec<u8>) -> OriginResult<()> {
        let tx = self.sender().await?;
        tx.send(Message::Ping(payload))
            .await
            .map_err(|e| OriginError::ChannelClosed(format!("Failed to send ping: {}", e)))
    }

    /// Ask the writer task to close the socket
    pub(crate) async fn send_close(&self) {
        if let Ok(tx) = self.sender().await {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    /// Resolve a response against the pending record
    pub async fn resolve(&self, sequence_id: u32) -> Option<String> {
        self.pending.lock().await.resolve(sequence_id)
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pending_command(&self, sequence_id: u32) -> Option<String> {
        self.pending.lock().await.get(sequence_id).map(str::to_string)
    }

    /// Next correlation id that will be assigned
    pub fn peek_sequence_id(&self) -> u32 {
        self.next_sequence_id.load(Ordering::SeqCst)
    }
}
