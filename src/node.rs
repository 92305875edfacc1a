use bytes::Bytes;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::Response;
use crate::server::Server;
use crate::transport;

/// Events fed into the server task by the connection tasks.
#[derive(Debug)]
pub enum ServerMessage {
    ClientRequest {
        uid: u32,
        frame: Bytes,
        reply: oneshot::Sender<Option<Response>>,
    },
    AgentConnected {
        peer: String,
        outbound: mpsc::UnboundedSender<Bytes>,
        reply: oneshot::Sender<AgentId>,
    },
    AgentFrame {
        agent: AgentId,
        frame: Bytes,
    },
    AgentDisconnected {
        agent: AgentId,
    },
}

/// Bounds how many client requests may wait for the server task.
const MESSAGE_CAPACITY: usize = 1024;

/// The running scheduler: listeners plus the task that owns the [`Server`].
pub struct Node {
    config: ServerConfig,
    server: Server,
}

impl Node {
    /// `server` must already have recovered from its journal.
    pub fn new(config: ServerConfig, server: Server) -> Self {
        Self { config, server }
    }

    /// Bind both listeners and serve until `shutdown` is cancelled.
    ///
    /// The connection tasks only move frames; every command runs on the
    /// server task, one at a time.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let clients = transport::bind_client_socket(&self.config.client_socket)?;
        let agents = TcpListener::bind(self.config.agent_listen_addr).await?;
        self.serve(clients, agents, shutdown).await
    }

    /// Serve on already-bound listeners.
    pub async fn serve(
        self,
        clients: UnixListener,
        agents: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel(MESSAGE_CAPACITY);

        tracing::info!(
            client_socket = %self.config.client_socket.display(),
            agent_addr = %agents.local_addr()?,
            readonly = self.config.readonly,
            "Accepting connections"
        );

        tokio::spawn(transport::serve_clients(clients, tx.clone(), shutdown.clone()));
        tokio::spawn(transport::serve_agents(agents, tx, shutdown.clone()));

        let interval = Duration::from_millis(self.config.schedule_interval_ms.max(1));
        let result = Self::event_loop(self.server, rx, interval, shutdown).await;

        if let Err(e) = std::fs::remove_file(&self.config.client_socket) {
            tracing::debug!(error = %e, "Client socket already removed");
        }
        result
    }

    /// Single owner of the server state. Applies events in arrival order and
    /// runs a schedule pass on every tick.
    async fn event_loop(
        mut server: Server,
        mut rx: mpsc::Receiver<ServerMessage>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Server loop shutting down");
                    break;
                }

                message = rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    Self::apply(&mut server, message);
                }

                _ = ticker.tick() => {
                    server.schedule_tick();
                    if let Err(e) = server.flush() {
                        tracing::error!(error = %e, "Failed to flush journal");
                    }
                }
            }
        }

        server.flush()?;
        tracing::info!("Journal flushed");
        Ok(())
    }

    fn apply(server: &mut Server, message: ServerMessage) {
        match message {
            ServerMessage::ClientRequest { uid, frame, reply } => {
                let response = server.handle_client(uid, frame);
                if reply.send(response).is_err() {
                    tracing::debug!(uid, "Client went away before its response");
                }
            }
            ServerMessage::AgentConnected {
                peer,
                outbound,
                reply,
            } => {
                let id = server.agent_connected(peer, outbound);
                if reply.send(id).is_err() {
                    server.agent_disconnected(id);
                }
            }
            ServerMessage::AgentFrame { agent, frame } => {
                if let Some(response) = server.handle_agent_frame(agent, frame) {
                    server.respond_to_agent(agent, &response);
                }
            }
            ServerMessage::AgentDisconnected { agent } => {
                server.agent_disconnected(agent);
            }
        }
    }
}
