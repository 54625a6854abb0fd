//! Node identity published by `tetherctl register`.

use serde::{Deserialize, Serialize};

/// What a registration key holds (codec-encoded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier
    pub node_id: String,
    /// Host name, or "unknown"
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub pid: u32,
    /// Unix timestamp of registration
    pub registered_at: i64,
}

impl NodeInfo {
    /// Describe this process, generating a node id if none is given
    pub fn collect(node_id: Option<String>) -> Self {
        Self {
            node_id: node_id.unwrap_or_else(generate_node_id),
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            registered_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// The kernel's hostname, falling back to `$HOSTNAME` (rarely exported)
fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect() {
        let info = NodeInfo::collect(Some("node-1".to_string()));
        assert_eq!(info.node_id, "node-1");
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert_eq!(info.hostname, info.hostname.trim());

        let generated = NodeInfo::collect(None);
        assert!(generated.node_id.starts_with("node-"));
        assert_eq!(generated.node_id.len(), "node-".len() + 8);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_hostname_comes_from_kernel() {
        let kernel = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap();
        if !kernel.trim().is_empty() {
            assert_eq!(hostname(), kernel.trim());
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let info = NodeInfo::collect(None);
        let payload = tether_common::codec::encode(&info).unwrap();
        let decoded: NodeInfo = tether_common::codec::decode(&payload).unwrap();
        assert_eq!(decoded, info);

        let json: serde_json::Value = tether_common::codec::decode(&payload).unwrap();
        assert_eq!(json["node_id"], info.node_id.as_str());
    }
}
