use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::node::ServerMessage;

/// Bind the client socket, replacing a stale one from an earlier run.
/// Every local user may connect; the peer uid decides what they may do.
pub fn bind_client_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

pub async fn serve_clients(
    listener: UnixListener,
    tx: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let tx = tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, tx, shutdown).await {
                                tracing::debug!(error = %e, "Client connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept client connection");
                    }
                }
            }
        }
    }
    tracing::debug!("Client listener stopped");
}

async fn handle_connection(
    stream: UnixStream,
    tx: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
) -> Result<()> {
    let uid = stream.peer_cred()?.uid();
    tracing::debug!(uid, "Client connected");

    let mut framed = Framed::new(stream, super::codec());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => match frame {
                Some(frame) => frame?,
                None => break,
            },
        };

        let (reply, response) = oneshot::channel();
        let message = ServerMessage::ClientRequest {
            uid,
            frame: frame.freeze(),
            reply,
        };
        if tx.send(message).await.is_err() {
            break;
        }

        match response.await {
            Ok(Some(response)) => framed.send(response.to_bytes()).await?,
            Ok(None) => {}
            Err(_) => break,
        }
    }

    tracing::debug!(uid, "Client disconnected");
    Ok(())
}
