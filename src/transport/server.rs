use log::{debug, warn};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::errors::{MontageError, Result};
use crate::transport::network::MAX_FRAME_LEN;
use crate::transport::{Envelope, MessageHandler};

/// Accepts connections forever, handing each one its own task.
pub(crate) async fn accept_loop(listener: TcpListener, handler: Arc<dyn MessageHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = read_frames(stream, handler).await {
                        warn!("Dropping connection from {}: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("Accept failed: {}", e),
        }
    }
}

async fn read_frames(mut stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<()> {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(MontageError::Transport(format!(
                "frame of {} bytes exceeds limit",
                len
            )));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let envelope: Envelope = bincode::deserialize(&buf)?;

        // Handlers take locks and touch the disk; keep them off the reactor.
        let handler = Arc::clone(&handler);
        let handled = tokio::task::spawn_blocking(move || {
            handler.deliver(&envelope.from, &envelope.body)
        })
        .await
        .map_err(|e| MontageError::Transport(e.to_string()))?;
        if !handled {
            debug!("Handler rejected a message");
        }
    }
}
