// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-component configuration.
//!
//! Every tunable is carried in a plain struct handed to the component's
//! constructor; there is no process-wide mutable configuration state.

use std::time::Duration;

use crate::transport::connector::BackoffPolicy;

/// Configuration for one peer session (queue + health check + decoder).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Heartbeat send interval.
    pub heartbeat_interval: Duration,

    /// How many heartbeat intervals of silence are allowed before the
    /// connection is declared unhealthy.
    pub missed_heartbeats_allowed: u32,

    /// Outbound queue cap in bytes.
    pub max_queue_bytes: usize,

    /// Maximum inbound message size accepted by the decoder.
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            missed_heartbeats_allowed: 3,
            max_queue_bytes: crate::transport::queue::DEFAULT_MAX_BUFFER_SIZE,
            max_message_size: crate::acn::codec::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    /// The receive deadline implied by the heartbeat settings.
    pub fn receive_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats_allowed
    }
}

/// Configuration for the device-side controller agent.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Maximum un-acked status messages held at once.
    pub max_outstanding: usize,

    /// Hard deadline for a single TCP connect attempt.
    pub connect_timeout: Duration,

    /// Delay before re-running controller selection when no candidate
    /// exists.
    pub reselect_delay: Duration,

    /// Priority penalty applied to a controller that refused a connect.
    pub failure_penalty: i16,

    /// Session settings for the controller connection.
    pub session: SessionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 10,
            connect_timeout: Duration::from_secs(5),
            reselect_delay: Duration::from_secs(2),
            failure_penalty: 200,
            session: SessionConfig::default(),
        }
    }
}

/// Configuration for the controller-side mesh.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// How often the peer list is refreshed from discovery.
    pub refresh_interval: Duration,

    /// Hard deadline for a single TCP connect attempt.
    pub connect_timeout: Duration,

    /// Retry policy for peer connects.
    pub backoff: BackoffPolicy,

    /// Session settings for peer connections.
    pub session: SessionConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            // Peers come and go on operator timescales; a linear climb to
            // the cap avoids hammering a controller that is rebooting.
            backoff: BackoffPolicy::linear(
                Duration::from_secs(5),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ),
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_timeout_is_three_heartbeats() {
        let config = SessionConfig::default();
        assert_eq!(config.receive_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_outstanding, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.failure_penalty, 200);
    }
}
