//! capgate sandbox - the process boundary
//!
//! The parent runs a [`Broker`] on a private Unix socket; the worker process
//! reaches it through [`capabilities_from_env`] and gets a capability object
//! whose every action is a brokered call. [`Execution`] drives one run end to
//! end: preflight, authority, broker, worker, cleanup.
//!
//! Unix only.

pub mod broker;
pub mod client;
pub mod error;
pub mod protocol;
pub mod runtime;

pub use broker::{Broker, BrokerConfig, BrokerLimits};
pub use client::{
    capabilities_from_env, remote_capabilities, ClientError, RemoteTool, WorkerClient, WorkerEnv,
};
pub use error::{BrokerError, SandboxError};
pub use protocol::{ErrorCode, Request, RequestId, Response, ResponseBody, RpcError};
pub use runtime::{Execution, ExecutionOutcome, OutputMode, Preflight, WorkerCommand};
