//! ACD backend
//!
//! Has no external transport: events arrive through a `ModuleHandle` and
//! sends go to an optional outbox channel.

use std::sync::OnceLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::BackendCapability;
use crate::bus::EventBus;
use crate::config::{ExtensionConfig, ExtensionKind};
use crate::error::SendError;

/// A send executed by an ACD module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub module: String,
    pub extension: String,
    pub content: String,
}

pub struct AcdBackend {
    module: String,
    outbox: OnceLock<mpsc::UnboundedSender<OutboundMessage>>,
}

impl AcdBackend {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            outbox: OnceLock::new(),
        }
    }

    pub fn with_outbox(
        module: impl Into<String>,
        outbox: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        let backend = Self::new(module);
        backend.attach_outbox(outbox);
        backend
    }

    /// Returns false when an outbox was already attached.
    pub fn attach_outbox(&self, outbox: mpsc::UnboundedSender<OutboundMessage>) -> bool {
        self.outbox.set(outbox).is_ok()
    }
}

#[async_trait]
impl BackendCapability for AcdBackend {
    fn kind(&self) -> &'static str {
        "acd"
    }

    fn accepts(&self, kind: ExtensionKind) -> bool {
        kind == ExtensionKind::Acd
    }

    async fn fire_send(&self, content: &str, extension: &str) -> Result<(), SendError> {
        let Some(outbox) = self.outbox.get() else {
            tracing::warn!(
                module = %self.module,
                extension,
                "send is not supported without an outbox; dropped"
            );
            return Ok(());
        };

        outbox
            .send(OutboundMessage {
                module: self.module.clone(),
                extension: extension.to_string(),
                content: content.to_string(),
            })
            .map_err(|_| SendError::Closed(self.module.clone()))
    }

    async fn produce(
        &self,
        _extensions: Vec<ExtensionConfig>,
        _events: EventBus,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}
