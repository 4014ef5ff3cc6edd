//! Interactive session handoff
//!
//! Protocol-upgrade requests never go through the HTTP forwarding path; the
//! established WebSocket is handed to a [`SessionHandler`] which owns it from
//! then on.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::cluster::ClusterContext;

/// Established WebSocket handed over by the upgrade handler
pub type SessionSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Takes ownership of upgraded connections
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Open an interactive session on an already-upgraded socket
    ///
    /// `node` carries the optional `node` query parameter from the upgrade
    /// request. A failed session is terminal for the connection; nothing is
    /// retried.
    async fn open_session(
        &self,
        socket: SessionSocket,
        cluster: ClusterContext,
        node: Option<String>,
    );
}

/// Reference session handler that echoes frames back
///
/// Used by the standalone binary and the end-to-end tests; real embedders
/// attach their own shell/exec session implementation.
pub struct EchoSessionHandler;

#[async_trait]
impl SessionHandler for EchoSessionHandler {
    async fn open_session(
        &self,
        socket: SessionSocket,
        cluster: ClusterContext,
        node: Option<String>,
    ) {
        info!(cluster = %cluster.id(), node = ?node, "Session opened");

        let (mut sink, mut stream) = socket.split();

        while let Some(message) = stream.next().await {
            match message {
                Ok(msg) if msg.is_text() || msg.is_binary() => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Session received close");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Session socket error: {}", e);
                    break;
                }
            }
        }

        info!(cluster = %cluster.id(), "Session closed");
    }
}
