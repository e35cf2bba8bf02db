//! Event socket transport seam
//!
//! The FreeSWITCH backend talks to the switch only through these traits; the
//! wire protocol lives in the implementation handed to the runtime.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::FreeSwitchConfig;

/// One authenticated event socket connection.
#[async_trait]
pub trait EventSocket: Send {
    /// Subscribe to every event, delivered as JSON bodies.
    async fn subscribe_all(&mut self) -> anyhow::Result<()>;

    /// Run an API command and return the response body.
    async fn api(&mut self, command: &str, timeout: Duration) -> anyhow::Result<String>;

    /// Wait for the next event body; `Ok(None)` when the timeout elapses.
    async fn recv_event(&mut self, timeout: Duration) -> anyhow::Result<Option<String>>;

    /// Write a raw command.
    async fn send(&mut self, command: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventSocketConnector: Send + Sync {
    async fn connect(
        &self,
        config: &FreeSwitchConfig,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn EventSocket>>;
}
