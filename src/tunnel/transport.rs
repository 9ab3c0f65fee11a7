//! Secure transport abstraction
//!
//! The transport owns the encrypted point-to-point link: it brings up the
//! local interface, runs privileged command batches on the far end, and tears
//! a tunnel down again by the handle it handed out.

use super::TunnelEndpoints;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to start transport: {0}")]
    SpawnError(#[from] std::io::Error),
    #[error("Transport exited before {interface} appeared: {status}")]
    Exited { interface: String, status: String },
    #[error("Timed out waiting for interface {0}")]
    EstablishTimeout(String),
    #[error("Local interface setup failed: {0}")]
    LocalSetup(String),
    #[error("Remote batch failed ({status}): {stderr}")]
    RemoteBatch { status: String, stderr: String },
    #[error("Remote batch timed out")]
    RemoteTimeout,
    #[error("Failed to terminate tunnel process {pid}: {message}")]
    Terminate { pid: u32, message: String },
    #[error("Failed to release interface {interface}: {message}")]
    Release { interface: String, message: String },
}

/// Identity of a running tunnel, returned by `establish` and kept for teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHandle {
    pub pid: u32,
}

/// How a remote batch reacts to a failing step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Abort at the first failing command
    StopOnError,
    /// Run every command regardless of earlier failures
    Continue,
}

/// Commands sent to the remote side in a single privileged round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBatch {
    pub commands: Vec<String>,
    pub mode: BatchMode,
}

impl RemoteBatch {
    pub fn new(mode: BatchMode) -> Self {
        Self {
            commands: Vec::new(),
            mode,
        }
    }

    pub fn push(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    pub fn extend<I, S>(&mut self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Render as one shell command line
    pub fn script(&self) -> String {
        let separator = match self.mode {
            BatchMode::StopOnError => " && ",
            BatchMode::Continue => "; ",
        };
        self.commands.join(separator)
    }
}

#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Bring up the interface pair and return the tracking handle
    async fn establish(&self, endpoints: &TunnelEndpoints) -> Result<TunnelHandle, TransportError>;
    async fn run_remote(&self, batch: &RemoteBatch) -> Result<(), TransportError>;
    /// Stop the tunnel process; an already-gone process is not an error
    async fn terminate(&self, handle: &TunnelHandle) -> Result<(), TransportError>;
    /// Drop whatever is left of the local interface
    async fn release_interface(&self, interface: &str) -> Result<(), TransportError>;
}
