//! Builder for creating call orchestrators

use std::sync::Arc;
use std::time::Duration;

use super::{CallOrchestrator, OrchestratorConfig};
use crate::error::{CallError, CallResult};
use crate::media::MediaEngine;
use crate::phase::PhaseMachineConfig;
use crate::recovery::RetryPolicy;
use crate::session::LocalParty;
use crate::signaling::SignalingChannel;

/// Builder for creating a call orchestrator
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    local: Option<LocalParty>,
    signaling: Option<Arc<dyn SignalingChannel>>,
    media: Option<Arc<dyn MediaEngine>>,
    retry: Option<Arc<RetryPolicy>>,
}

impl OrchestratorBuilder {
    /// Create a new orchestrator builder
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            local: None,
            signaling: None,
            media: None,
            retry: None,
        }
    }

    /// Set the local identity
    pub fn local_party(mut self, local: LocalParty) -> Self {
        self.local = Some(local);
        self
    }

    pub fn signaling(mut self, signaling: Arc<dyn SignalingChannel>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn media(mut self, media: Arc<dyn MediaEngine>) -> Self {
        self.media = Some(media);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn machine_config(mut self, machine: PhaseMachineConfig) -> Self {
        self.config.machine = machine;
        self
    }

    /// Share a retry policy (and its circuit breaker) with other orchestrators
    pub fn retry_policy(mut self, retry: Arc<RetryPolicy>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn call_setup_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_setup_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    /// Build the orchestrator. Must be called within a Tokio runtime.
    pub fn build(self) -> CallResult<Arc<CallOrchestrator>> {
        let local = self
            .local
            .ok_or_else(|| CallError::initialization_failed("local party not configured"))?;
        let signaling = self
            .signaling
            .ok_or_else(|| CallError::initialization_failed("signaling channel not configured"))?;
        let media = self
            .media
            .ok_or_else(|| CallError::initialization_failed("media engine not configured"))?;

        Ok(CallOrchestrator::new(self.config, local, signaling, media, self.retry))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
