//! Testbed-Dispatch: runs assignments on target hosts.
//!
//! ## Key Components
//!
//! - `Driver`: local subprocess supervision with deadlock-free stream capture
//! - `protocol`: framed request/response messages between orchestrator and agent
//! - `Agent`: the target-host side, staging artifacts and running commands
//! - `AgentConnector`: transport seam (`TcpConnector`, `LocalConnector`)
//! - `RemoteExecutor`: one assignment through stage, execute and cleanup
//! - `Orchestrator` / `JobRun`: per-host sequencing, cross-host parallelism

pub mod abort;
pub mod agent;
pub mod connector;
pub mod driver;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod protocol;
pub mod remote;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use agent::Agent;
pub use connector::{AgentConnector, AgentSession, FramedSession, LocalConnector, TcpConnector};
pub use driver::{CommandSpec, Driver, DriverOutput, ReaderFailure, StreamKind, TaggedLine};
pub use error::{
    AgentError, AgentResult, DispatchError, DispatchResult, DriverError, DriverResult,
    ProtocolError, ProtocolResult,
};
pub use orchestrator::{JobRun, Orchestrator};
pub use remote::RemoteExecutor;
