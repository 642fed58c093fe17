//! Connections from the orchestrator to agents.
//!
//! [`AgentConnector`] is the seam between the remote executor and the
//! transport. Production uses [`TcpConnector`]; [`LocalConnector`] runs an
//! in-process agent over an in-memory duplex pipe, which is what `localhost`
//! runs and most tests use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use testbed_state::HostId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{DispatchError, DispatchResult, ProtocolError, ProtocolResult};
use crate::protocol::{read_frame, write_frame, Request, Response};

/// One open conversation with an agent. Dropping it closes the connection,
/// which makes the agent kill anything still running for it.
#[async_trait]
pub trait AgentSession: Send {
    /// Send one request and wait for its response.
    async fn call(&mut self, request: &Request) -> ProtocolResult<Response>;
}

/// Opens sessions to agents by host.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, host: &HostId) -> DispatchResult<Box<dyn AgentSession>>;
}

/// Framed request/response over any byte stream.
pub struct FramedSession<S> {
    stream: S,
}

impl<S> FramedSession<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> AgentSession for FramedSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn call(&mut self, request: &Request) -> ProtocolResult<Response> {
        write_frame(&mut self.stream, request).await?;
        read_frame(&mut self.stream)
            .await?
            .ok_or(ProtocolError::Closed)
    }
}

/// Reaches agents over TCP on a fixed port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl AgentConnector for TcpConnector {
    async fn connect(&self, host: &HostId) -> DispatchResult<Box<dyn AgentSession>> {
        let fail = |reason: String| DispatchError::Connection {
            host: host.to_string(),
            reason,
        };
        let addr = (host.as_str(), self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| fail(format!("no answer within {:?}", self.connect_timeout)))?
            .map_err(|e| fail(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(host = %host, error = %e, "set_nodelay failed");
        }
        debug!(host = %host, port = self.port, "connected to agent");
        Ok(Box::new(FramedSession::new(stream)))
    }
}

/// Serves every host from one in-process agent.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    agent: Arc<Agent>,
}

/// Buffer size of the in-memory pipe; frames larger than this still pass,
/// they are just copied in pieces.
const LOCAL_PIPE_CAPACITY: usize = 1024 * 1024;

impl LocalConnector {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }
}

#[async_trait]
impl AgentConnector for LocalConnector {
    async fn connect(&self, host: &HostId) -> DispatchResult<Box<dyn AgentSession>> {
        let (client, server) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
        let agent = Arc::clone(&self.agent);
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = agent.handle_connection(server).await {
                warn!(host = %host, error = %e, "local agent connection failed");
            }
        });
        Ok(Box::new(FramedSession::new(client)))
    }
}
