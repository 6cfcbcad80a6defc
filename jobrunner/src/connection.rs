//! How commands reach a peer.
//!
//! Only the in-process transport lives here; anything going over the
//! network implements [`Connection`] and [`Connector`] the same way.

use async_std::channel::{Receiver, Sender};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::commands::Command;

/// Encoded commands addressed to one peer.
pub type Inbox = Receiver<Vec<u8>>;

#[async_trait]
pub trait Connection: Send + Sync {
    fn address(&self) -> &str;

    async fn send_request(&self, command: Command) -> anyhow::Result<()>;

    /// `Err` carries the reason the response could not be delivered.
    async fn send_response(&self, command: Command) -> anyhow::Result<()>;
}

/// Turns an address into a [`Connection`].
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>>;
}

/// Peers living in the same process, reachable by address.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    peers: Arc<RwLock<HashMap<String, Sender<Vec<u8>>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `address`; everything sent to it arrives in the returned inbox.
    pub fn bind(&self, address: &str) -> anyhow::Result<Inbox> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = peers.get(address) {
            if !existing.is_closed() {
                anyhow::bail!("Address {} is already in use", address);
            }
        }

        let (tx, rx) = async_std::channel::unbounded();
        peers.insert(address.to_string(), tx);
        tracing::debug!("Listening on {}", address);
        Ok(rx)
    }

    pub fn unbind(&self, address: &str) {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if let Some(tx) = removed {
            tx.close();
        }
    }
}

impl Connector for LocalNetwork {
    fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let tx = peers
            .get(address)
            .ok_or_else(|| anyhow::anyhow!("No peer listening on {}", address))?;

        Ok(Arc::new(LocalConnection {
            address: address.to_string(),
            tx: tx.clone(),
        }))
    }
}

pub struct LocalConnection {
    address: String,
    tx: Sender<Vec<u8>>,
}

impl LocalConnection {
    async fn deliver(&self, mut command: Command) -> anyhow::Result<()> {
        command.inject_trace_context();
        let bytes = command.to_bytes()?;

        self.tx
            .send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("Peer {} is no longer listening", self.address))
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send_request(&self, command: Command) -> anyhow::Result<()> {
        if !command.is_request() {
            anyhow::bail!("Command {} is a response, not a request", command.id());
        }
        self.deliver(command).await
    }

    async fn send_response(&self, command: Command) -> anyhow::Result<()> {
        if command.is_request() {
            anyhow::bail!("Command {} is a request, not a response", command.id());
        }
        self.deliver(command).await
    }
}
