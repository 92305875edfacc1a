use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::node::ServerMessage;

pub async fn serve_agents(
    listener: TcpListener,
    tx: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept = listener.accept() => {
                match accept {
                    Ok((stream, addr)) => {
                        let tx = tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_connection(stream, addr.to_string(), tx, shutdown));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept agent connection");
                    }
                }
            }
        }
    }
    tracing::debug!("Agent listener stopped");
}

/// Register the agent, then pump frames both ways until either side closes.
async fn handle_connection(
    stream: TcpStream,
    peer: String,
    tx: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (mut sink, mut frames) = Framed::new(stream, super::codec()).split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let (reply, registered) = oneshot::channel();

    let message = ServerMessage::AgentConnected {
        peer: peer.clone(),
        outbound,
        reply,
    };
    if tx.send(message).await.is_err() {
        return;
    }
    let Ok(agent) = registered.await else {
        return;
    };

    // Ends when the server drops the agent's sender or the socket fails.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!(agent = %agent, error = %e, "Agent write failed");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                let message = ServerMessage::AgentFrame {
                    agent,
                    frame: frame.freeze(),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(agent = %agent, peer = %peer, error = %e, "Agent read failed");
                break;
            }
            None => break,
        }
    }

    // The server may already be gone during shutdown.
    let _ = tx.send(ServerMessage::AgentDisconnected { agent }).await;
    writer.abort();
}
