//! Contract with the instance-management subsystem read by the
//! `GetInstanceState` activity.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstanceError {
    #[error("instance '{name}' not found in project '{project}'")]
    NotFound { project: String, name: String },

    #[error("failed to render state of instance '{name}': {message}")]
    Render { name: String, message: String },
}

/// A network interface of the host, as seen when the state is rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInterface {
    pub name: String,
    pub index: Option<u32>,
    pub mtu: Option<u32>,
    pub hardware_address: Option<String>,
    pub up: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub family: String,
    pub address: String,
    pub netmask: String,
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub addresses: Vec<NetworkAddress>,
    pub hwaddr: String,
    /// Interface on the host side of the link, when it exists
    pub host_name: String,
    pub mtu: u32,
    pub state: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Runtime state of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub status: String,
    pub status_code: i32,
    pub pid: i64,
    pub processes: i64,
    pub cpu_usage_ns: i64,
    pub memory_usage_bytes: i64,
    #[serde(default)]
    pub network: BTreeMap<String, NetworkState>,
}

/// A loaded instance
pub trait Instance: Send + Sync {
    fn project(&self) -> &str;
    fn name(&self) -> &str;

    /// Render the current state, using `host_interfaces` to resolve the host
    /// side of each network link
    fn render_state(&self, host_interfaces: &[HostInterface]) -> Result<InstanceState, InstanceError>;
}

/// Looks instances up by project and name
#[async_trait]
pub trait InstanceSource: Send + Sync + 'static {
    async fn load_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Box<dyn Instance>, InstanceError>;
}

/// Enumerate the host's network interfaces from sysfs.
///
/// Best effort: unreadable entries are skipped and a host without sysfs
/// yields an empty list.
pub fn host_interfaces() -> Vec<HostInterface> {
    host_interfaces_in(Path::new("/sys/class/net"))
}

fn host_interfaces_in(root: &Path) -> Vec<HostInterface> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let read = |dir: &Path, file: &str| -> Option<String> {
        std::fs::read_to_string(dir.join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let mut interfaces: Vec<HostInterface> = entries
        .flatten()
        .map(|entry| {
            let dir = entry.path();
            HostInterface {
                name: entry.file_name().to_string_lossy().into_owned(),
                index: read(&dir, "ifindex").and_then(|s| s.parse().ok()),
                mtu: read(&dir, "mtu").and_then(|s| s.parse().ok()),
                hardware_address: read(&dir, "address"),
                up: read(&dir, "operstate").as_deref() == Some("up"),
            }
        })
        .collect();
    interfaces.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
    interfaces
}

/// In-memory instance source holding fixed states
#[derive(Clone, Default)]
pub struct MemoryInstanceSource {
    instances: Arc<RwLock<HashMap<(String, String), InstanceState>>>,
}

impl MemoryInstanceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: &str, name: &str, state: InstanceState) {
        self.instances
            .write()
            .insert((project.to_string(), name.to_string()), state);
    }
}

struct MemoryInstance {
    project: String,
    name: String,
    state: InstanceState,
}

impl Instance for MemoryInstance {
    fn project(&self) -> &str {
        &self.project
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn render_state(&self, host_interfaces: &[HostInterface]) -> Result<InstanceState, InstanceError> {
        let mut state = self.state.clone();
        // Drop host-side names that no longer exist on this host.
        for network in state.network.values_mut() {
            if !network.host_name.is_empty()
                && !host_interfaces.iter().any(|i| i.name == network.host_name)
            {
                network.host_name.clear();
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl InstanceSource for MemoryInstanceSource {
    async fn load_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Box<dyn Instance>, InstanceError> {
        let state = self
            .instances
            .read()
            .get(&(project.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| InstanceError::NotFound {
                project: project.to_string(),
                name: name.to_string(),
            })?;
        Ok(Box::new(MemoryInstance {
            project: project.to_string(),
            name: name.to_string(),
            state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> InstanceState {
        let mut network = BTreeMap::new();
        network.insert(
            "eth0".to_string(),
            NetworkState {
                host_name: "veth-missing".to_string(),
                mtu: 1500,
                state: "up".to_string(),
                kind: "broadcast".to_string(),
                ..NetworkState::default()
            },
        );
        InstanceState {
            status: "Running".to_string(),
            status_code: 103,
            pid: 4242,
            processes: 12,
            network,
            ..InstanceState::default()
        }
    }

    #[tokio::test]
    async fn test_memory_source_loads_and_renders() {
        let source = MemoryInstanceSource::new();
        source.insert("default", "c1", running());

        let instance = source.load_instance("default", "c1").await.unwrap();
        assert_eq!(instance.project(), "default");
        assert_eq!(instance.name(), "c1");

        let state = instance.render_state(&[]).unwrap();
        assert_eq!(state.status, "Running");
        assert_eq!(state.network["eth0"].host_name, "");

        let host = HostInterface {
            name: "veth-missing".to_string(),
            index: Some(7),
            mtu: Some(1500),
            hardware_address: None,
            up: true,
        };
        let state = instance.render_state(&[host]).unwrap();
        assert_eq!(state.network["eth0"].host_name, "veth-missing");
    }

    #[tokio::test]
    async fn test_missing_instance() {
        let source = MemoryInstanceSource::new();
        let err = source.load_instance("default", "ghost").await.err().unwrap();
        assert_eq!(
            err,
            InstanceError::NotFound {
                project: "default".to_string(),
                name: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_host_interfaces_missing_root_is_empty() {
        assert!(host_interfaces_in(Path::new("/definitely/not/here")).is_empty());
    }

    #[test]
    fn test_state_serializes_network_kind_as_type() {
        let value = serde_json::to_value(running()).unwrap();
        assert_eq!(value["network"]["eth0"]["type"], "broadcast");
    }
}
