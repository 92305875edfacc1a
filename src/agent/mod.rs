//! Connected execution agents and message routing to them.
//!
//! Each agent connection owns an outbound channel drained by its transport
//! task. Delivery is fire-and-forget: a message to an agent that has gone
//! away is logged and dropped.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;

use crate::protocol::{verbs, Field, FieldNumber, Item, Request, Response};
use crate::scheduler::QueueTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u64);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

#[derive(Debug)]
pub struct Agent {
    pub id: AgentId,
    /// Remote address of the connection.
    pub peer: String,
    /// Host the agent logged in as.
    pub host: Option<String>,
    pub logged_in: bool,
    /// Challenge sent to the agent, awaiting its AUTH reply.
    pub auth_nonce: Option<String>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl Agent {
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// A client tunneled through an agent, identified by the process id the
/// agent assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySession {
    pub uid: u32,
}

#[derive(Debug, Default)]
pub struct AgentRelay {
    agents: BTreeMap<AgentId, Agent>,
    next_id: u64,
    proxies: HashMap<(AgentId, u32), ProxySession>,
}

impl AgentRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, peer: impl Into<String>, outbound: mpsc::UnboundedSender<Bytes>) -> AgentId {
        self.next_id += 1;
        let id = AgentId(self.next_id);
        let peer = peer.into();
        tracing::info!(agent = %id, peer = %peer, "Agent connected");
        self.agents.insert(
            id,
            Agent {
                id,
                peer,
                host: None,
                logged_in: false,
                auth_nonce: None,
                outbound,
            },
        );
        id
    }

    /// Forget an agent and every proxy session tunneled through it.
    pub fn disconnect(&mut self, id: AgentId) -> Option<Agent> {
        self.proxies.retain(|(agent, _), _| *agent != id);
        let agent = self.agents.remove(&id)?;
        tracing::info!(agent = %id, host = ?agent.host, "Agent disconnected");
        Some(agent)
    }

    pub fn get(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Logged-in agent for `host`, if any.
    pub fn find_host(&self, host: &str) -> Option<AgentId> {
        self.agents
            .values()
            .find(|a| a.logged_in && a.host.as_deref() == Some(host))
            .map(|a| a.id)
    }

    /// Queue a message on an agent's connection. Returns false if the agent
    /// is unknown or its connection is gone.
    pub fn deliver(&self, id: AgentId, request: &Request) -> bool {
        self.push(id, Bytes::from(request.encode_to_vec()), &request.command)
    }

    /// Send a command's reply back on the agent connection it came from.
    pub fn respond(&self, id: AgentId, response: &Response) -> bool {
        self.push(id, response.to_bytes(), "response")
    }

    fn push(&self, id: AgentId, frame: Bytes, what: &str) -> bool {
        let Some(agent) = self.agents.get(&id) else {
            tracing::warn!(agent = %id, verb = what, "Message for unknown agent dropped");
            return false;
        };

        if agent.outbound.send(frame).is_err() {
            tracing::warn!(agent = %id, verb = what, "Agent connection closed, message dropped");
            return false;
        }
        tracing::debug!(agent = %id, verb = what, "Message queued for agent");
        true
    }

    /// Deliver to whichever agent currently services `queue`.
    pub fn deliver_to_queue(&self, queues: &QueueTable, queue: &str, request: &Request) -> bool {
        match queues.get(queue).and_then(|q| q.agent) {
            Some(agent) => self.deliver(agent, request),
            None => {
                tracing::warn!(queue, verb = %request.command, "No agent for queue, message dropped");
                false
            }
        }
    }

    pub fn open_proxy(&mut self, agent: AgentId, pid: u32, uid: u32) {
        tracing::debug!(agent = %agent, pid, uid, "Proxy session opened");
        self.proxies.insert((agent, pid), ProxySession { uid });
    }

    pub fn proxy(&self, agent: AgentId, pid: u32) -> Option<ProxySession> {
        self.proxies.get(&(agent, pid)).copied()
    }

    pub fn close_proxy(&mut self, agent: AgentId, pid: u32) -> bool {
        self.proxies.remove(&(agent, pid)).is_some()
    }

    /// Send a response to a tunneled client: wrapped in PROXY_DATA, keyed by
    /// the session's pid, to the agent that owns the session.
    pub fn forward_response(&self, agent: AgentId, pid: u32, response: &Response) -> bool {
        let item = Item::new()
            .with(Field::int(FieldNumber::Pid, i64::from(pid)))
            .with(Field::blob(FieldNumber::ProxyData, response.to_bytes().to_vec()));
        self.deliver(agent, &Request::with_item(verbs::PROXY_DATA, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Queue;

    fn decode(frame: Bytes) -> Request {
        Request::decode(frame).unwrap()
    }

    #[test]
    fn deliver_pushes_encoded_frame() {
        let mut relay = AgentRelay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = relay.connect("10.0.0.1:5000", tx);

        assert!(relay.deliver(id, &Request::new(verbs::RECON_REQ)));
        let frame = rx.try_recv().unwrap();
        assert_eq!(decode(frame).command, verbs::RECON_REQ);
    }

    #[test]
    fn deliver_to_closed_or_unknown_agent_is_dropped() {
        let mut relay = AgentRelay::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = relay.connect("peer", tx);
        drop(rx);

        assert!(!relay.deliver(id, &Request::new(verbs::SIG_JOB)));
        assert!(!relay.deliver(AgentId(99), &Request::new(verbs::SIG_JOB)));
    }

    #[test]
    fn queue_routing_uses_bound_agent() {
        let mut relay = AgentRelay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = relay.connect("peer", tx);

        let mut queues = QueueTable::new();
        queues.insert(Queue::new("batch").with_node("host1")).unwrap();
        assert!(!relay.deliver_to_queue(&queues, "batch", &Request::new(verbs::SIG_JOB)));

        queues.bind_agent("host1", id);
        assert!(relay.deliver_to_queue(&queues, "batch", &Request::new(verbs::SIG_JOB)));
        assert_eq!(decode(rx.try_recv().unwrap()).command, verbs::SIG_JOB);
    }

    #[test]
    fn forwarded_response_is_wrapped_with_pid() {
        let mut relay = AgentRelay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = relay.connect("peer", tx);

        assert!(relay.forward_response(id, 321, &Response::simple("0")));
        let wrapper = decode(rx.try_recv().unwrap());
        assert_eq!(wrapper.command, verbs::PROXY_DATA);

        let item = &wrapper.items[0];
        assert_eq!(item.get(FieldNumber::Pid).unwrap().as_int().unwrap(), 321);
        let inner = item.get(FieldNumber::ProxyData).unwrap().as_blob().unwrap();
        let inner = Response::decode(inner.as_slice()).unwrap();
        assert_eq!(inner.as_simple(), Some("0"));
    }

    #[test]
    fn disconnect_drops_proxy_sessions() {
        let mut relay = AgentRelay::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = relay.connect("peer", tx);
        relay.open_proxy(id, 10, 1000);
        assert_eq!(relay.proxy(id, 10), Some(ProxySession { uid: 1000 }));

        relay.disconnect(id);
        assert!(relay.proxy(id, 10).is_none());
        assert!(relay.get(id).is_none());
    }
}
