use ahash::AHashMap as HashMap;
use log::{debug, warn};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

use crate::errors::{MontageError, Result};
use crate::transport::server::accept_loop;
use crate::transport::{Envelope, MessageHandler, Transport};
use crate::types::NodeId;

/// Largest frame a peer may send. Artifacts travel inside vote requests, so
/// this is generous.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// A [`Transport`] over TCP.
///
/// Each message is sent on its own connection as a big-endian `u32` length
/// followed by a bincode-encoded [`Envelope`]. Sends are spawned onto the
/// runtime and never block the caller; connect or write failures are logged
/// and the message is lost, which the protocol's retries absorb.
pub struct TcpNetwork {
    node_id: NodeId,
    peers: RwLock<HashMap<NodeId, String>>,
    runtime: Arc<Runtime>,
}

impl TcpNetwork {
    /// Creates a network with its own multi-threaded runtime.
    ///
    /// # Arguments
    ///
    /// * `node_id` - The identity outgoing messages are sent as.
    /// * `peers` - Address (`host:port`) of every node this node sends to.
    pub fn new(
        node_id: impl Into<NodeId>,
        peers: impl IntoIterator<Item = (NodeId, String)>,
    ) -> Result<Self> {
        let runtime = Runtime::new()?;
        Ok(Self::with_runtime(node_id, peers, Arc::new(runtime)))
    }

    /// Creates a network that shares an existing runtime.
    pub fn with_runtime(
        node_id: impl Into<NodeId>,
        peers: impl IntoIterator<Item = (NodeId, String)>,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            peers: RwLock::new(peers.into_iter().collect()),
            runtime,
        }
    }

    pub fn add_peer(&self, id: impl Into<NodeId>, addr: impl Into<String>) {
        self.peers.write().insert(id.into(), addr.into());
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Binds `listen` and delivers every inbound message to `handler`.
    ///
    /// Returns the bound address once the listener is up; the accept loop
    /// keeps running on the runtime.
    pub fn serve(&self, listen: &str, handler: Arc<dyn MessageHandler>) -> Result<SocketAddr> {
        let listener = self.runtime.block_on(TcpListener::bind(listen))?;
        let addr = listener.local_addr()?;
        debug!("{} listening on {}", self.node_id, addr);
        self.runtime.spawn(accept_loop(listener, handler));
        Ok(addr)
    }

    /// Sends `body` to `target` and waits until it has been written.
    ///
    /// For one-shot clients that exit right after sending.
    pub fn send_and_wait(&self, target: &NodeId, body: Vec<u8>) -> Result<()> {
        let addr = self.peer_addr(target).ok_or_else(|| {
            MontageError::Transport(format!("no address known for {}", target))
        })?;
        let frame = self.frame(body)?;
        self.runtime.block_on(write_frame(&addr, &frame))
    }

    fn peer_addr(&self, target: &NodeId) -> Option<String> {
        self.peers.read().get(target).cloned()
    }

    fn frame(&self, body: Vec<u8>) -> Result<Vec<u8>> {
        let envelope = Envelope {
            from: self.node_id.clone(),
            body,
        };
        let encoded = bincode::serialize(&envelope)?;
        if encoded.len() > MAX_FRAME_LEN {
            return Err(MontageError::Transport(format!(
                "message of {} bytes exceeds frame limit",
                encoded.len()
            )));
        }
        let mut frame = Vec::with_capacity(4 + encoded.len());
        frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        frame.extend_from_slice(&encoded);
        Ok(frame)
    }
}

impl Transport for TcpNetwork {
    fn local_id(&self) -> &NodeId {
        &self.node_id
    }

    fn send(&self, target: &NodeId, body: Vec<u8>) -> Result<()> {
        let Some(addr) = self.peer_addr(target) else {
            warn!("{} -> {}: no address known, message dropped", self.node_id, target);
            return Ok(());
        };
        let frame = self.frame(body)?;
        let target = target.clone();
        self.runtime.spawn(async move {
            if let Err(e) = write_frame(&addr, &frame).await {
                warn!("Failed to send to {} at {}: {}", target, addr, e);
            }
        });
        Ok(())
    }
}

async fn write_frame(addr: &str, frame: &[u8]) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(frame).await?;
    stream.shutdown().await?;
    Ok(())
}
