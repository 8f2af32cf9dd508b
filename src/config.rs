//! Configuration for a deferral node

use crate::client::DialOptions;
use crate::engine::{validate_task_queue, EngineOptions};
use crate::worker::WorkerOptions;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Task queue used when none is configured
pub const DEFAULT_TASK_QUEUE: &str = "DEFERRAL_TASK_QUEUE";

pub const DEFAULT_BASE_PORT: u16 = 5233;
pub const DEFAULT_PORT_STRIDE: u16 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node id must be positive")]
    InvalidNodeId,

    /// `base_port + port_stride * (node_id - 1)` does not fit in a port
    #[error("node {node_id} has no valid frontend port (base {base_port}, stride {port_stride})")]
    PortOutOfRange {
        node_id: u64,
        base_port: u16,
        port_stride: u16,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for starting a node.
///
/// Each node runs its own coordinator, so nodes sharing a host are kept
/// apart by deriving the frontend port from the node id.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Externally assigned node number, also used for the node identity
    pub node_id: u64,

    /// Address the coordinator listens on
    pub listen_ip: IpAddr,

    /// Frontend port of node 1
    pub base_port: u16,

    /// Port distance between consecutive node ids
    pub port_stride: u16,

    /// Cluster this node reports from its health endpoint
    pub cluster_id: Uuid,

    /// Queue the worker polls and the greeting workflow is submitted to
    pub task_queue: String,

    /// How long dependent roles wait for the coordinator before failing.
    /// None waits until shutdown.
    pub readiness_timeout: Option<Duration>,

    /// How long shutdown waits for roles before aborting them
    pub shutdown_grace: Duration,

    pub dial: DialOptions,
    pub worker: WorkerOptions,
    pub engine: EngineOptions,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: DEFAULT_BASE_PORT,
            port_stride: DEFAULT_PORT_STRIDE,
            cluster_id: Uuid::new_v4(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            readiness_timeout: None,
            shutdown_grace: Duration::from_secs(10),
            dial: DialOptions::default(),
            worker: WorkerOptions::default(),
            engine: EngineOptions::default(),
        }
    }
}

impl NodeConfig {
    /// Configuration for `node_id` with every other setting at its default
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_port_stride(mut self, stride: u16) -> Self {
        self.port_stride = stride;
        self
    }

    pub fn with_cluster_id(mut self, cluster_id: Uuid) -> Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_dial_options(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_worker_options(mut self, worker: WorkerOptions) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_engine_options(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Name this node reports to the coordinator
    pub fn identity(&self) -> String {
        format!("node{}", self.node_id)
    }

    /// Port the coordinator listens on
    pub fn frontend_port(&self) -> Result<u16, ConfigError> {
        let out_of_range = || ConfigError::PortOutOfRange {
            node_id: self.node_id,
            base_port: self.base_port,
            port_stride: self.port_stride,
        };
        let offset = self
            .node_id
            .checked_sub(1)
            .ok_or(ConfigError::InvalidNodeId)?
            .checked_mul(u64::from(self.port_stride))
            .ok_or_else(out_of_range)?;
        let port = u64::from(self.base_port)
            .checked_add(offset)
            .ok_or_else(out_of_range)?;
        u16::try_from(port).map_err(|_| out_of_range())
    }

    pub fn frontend_address(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.listen_ip, self.frontend_port()?))
    }

    /// Check every setting without binding anything
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::InvalidNodeId);
        }
        self.frontend_port()?;
        validate_task_queue(&self.task_queue).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.worker.max_concurrent_workflow_tasks == 0
            || self.worker.max_concurrent_activities == 0
        {
            return Err(ConfigError::Invalid(
                "worker needs at least one workflow slot and one activity slot".to_string(),
            ));
        }
        if self.engine.max_long_poll.is_zero() || self.engine.reap_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "engine long poll and reap interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.identity(), "node1");
        assert_eq!(config.task_queue, DEFAULT_TASK_QUEUE);
        assert_eq!(
            config.frontend_address().unwrap(),
            "127.0.0.1:5233".parse::<SocketAddr>().unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frontend_port_follows_node_id() {
        assert_eq!(NodeConfig::new(2).frontend_port().unwrap(), 5243);
        assert_eq!(
            NodeConfig::new(3)
                .with_base_port(7000)
                .with_port_stride(1)
                .frontend_port()
                .unwrap(),
            7002
        );
        // Node ids are not limited to a single digit.
        assert_eq!(NodeConfig::new(12).frontend_port().unwrap(), 5343);
    }

    #[test]
    fn test_frontend_port_overflow_is_rejected() {
        let err = NodeConfig::new(10_000).frontend_port().unwrap_err();
        assert!(matches!(err, ConfigError::PortOutOfRange { node_id: 10_000, .. }));

        let err = NodeConfig::new(u64::MAX).validate().unwrap_err();
        assert!(matches!(err, ConfigError::PortOutOfRange { .. }));
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            NodeConfig::new(0).validate().unwrap_err(),
            ConfigError::InvalidNodeId
        ));
        assert!(matches!(
            NodeConfig::new(1).with_task_queue("has space").validate().unwrap_err(),
            ConfigError::Invalid(_)
        ));
        assert!(matches!(
            NodeConfig::new(1)
                .with_worker_options(WorkerOptions {
                    max_concurrent_workflow_tasks: 0,
                    ..WorkerOptions::default()
                })
                .validate()
                .unwrap_err(),
            ConfigError::Invalid(_)
        ));
        assert!(matches!(
            NodeConfig::new(1)
                .with_worker_options(WorkerOptions {
                    max_concurrent_activities: 0,
                    ..WorkerOptions::default()
                })
                .validate()
                .unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn test_builder_overrides() {
        let cluster_id = Uuid::new_v4();
        let config = NodeConfig::new(4)
            .with_cluster_id(cluster_id)
            .with_readiness_timeout(Duration::from_secs(2))
            .with_listen_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.cluster_id, cluster_id);
        assert_eq!(config.readiness_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.identity(), "node4");
        assert_eq!(config.frontend_address().unwrap().port(), 5263);
    }
}
