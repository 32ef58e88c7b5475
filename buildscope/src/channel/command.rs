//! Controller → agent commands.

use std::net::SocketAddr;
use std::time::Duration;

use buildscope_common::ControlCommand;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::domain::AgentCommunicationError;

/// Sends one command per short-lived connection to the agent's listener.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    addr: SocketAddr,
    /// Bounds connect + write of a single command
    timeout: Duration,
}

impl CommandChannel {
    #[must_use]
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Deliver `command` at most once.
    ///
    /// # Errors
    /// Connect failures, write failures and timeouts are reported separately;
    /// none of them is retried.
    pub async fn send(&self, command: ControlCommand) -> Result<(), AgentCommunicationError> {
        let addr = self.addr;
        let deliver = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|source| AgentCommunicationError::Connect { addr, command, source })?;
            stream
                .write_all(command.to_line().as_bytes())
                .await
                .map_err(|source| AgentCommunicationError::Send { addr, command, source })?;
            stream
                .shutdown()
                .await
                .map_err(|source| AgentCommunicationError::Send { addr, command, source })
        };

        tokio::time::timeout(self.timeout, deliver).await.map_err(|_| {
            AgentCommunicationError::Timeout { addr, command, timeout: self.timeout }
        })??;

        debug!("Sent '{command}' to agent at {addr}");
        Ok(())
    }
}
