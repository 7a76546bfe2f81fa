//! Workspace lifecycle on top of the relay session client: start a
//! workspace, poll until its connection details are ready, join the
//! session, and watch asynchronous setup state through a tunnel.

pub mod api;
pub mod connect;
pub mod error;
pub mod states;

pub use api::{RemoteExec, Workspace, WorkspaceApi, WorkspaceState};
pub use connect::{ConnectPolicy, connect, wait_until_ready};
pub use error::WorkspaceError;
pub use states::{StepStatus, WatchPolicy, WorkspaceStep, watch_steps};
