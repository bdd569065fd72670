use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::phase::{PhaseMachineConfig, TimeoutKind};
use crate::recovery::{CircuitBreakerConfig, RetryConfig};

/// Configuration for the call orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound for the whole `initialize()` bootstrap, retries included
    pub initialization_timeout: Duration,
    /// Ringing / waiting for the remote party to answer
    pub call_setup_timeout: Duration,
    /// SDP/ICE exchange after acceptance
    pub negotiation_timeout: Duration,
    /// Best-effort teardown of the media path
    pub teardown_timeout: Duration,
    pub machine: PhaseMachineConfig,
    /// Retry policy for the bootstrap operations
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Capacity of the `CallEvent` broadcast channel
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(10),
            call_setup_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(3),
            machine: PhaseMachineConfig::default(),
            retry: RetryConfig::quick(),
            circuit_breaker: CircuitBreakerConfig::default(),
            event_buffer: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = timeout;
        self
    }

    pub fn with_call_setup_timeout(mut self, timeout: Duration) -> Self {
        self.call_setup_timeout = timeout;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn with_machine(mut self, machine: PhaseMachineConfig) -> Self {
        self.machine = machine;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Budget for a timeout category
    pub fn timeout_for(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::Initialization => self.initialization_timeout,
            TimeoutKind::CallSetup => self.call_setup_timeout,
            TimeoutKind::Negotiation => self.negotiation_timeout,
            TimeoutKind::Teardown => self.teardown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_through_json() {
        let config = OrchestratorConfig::default()
            .with_call_setup_timeout(Duration::from_secs(45))
            .with_machine(PhaseMachineConfig::default().with_terminal_grace(Duration::from_millis(250)));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.timeout_for(TimeoutKind::CallSetup), Duration::from_secs(45));
        assert_eq!(parsed.machine.mailbox_capacity, 50);
    }
}
