//! Network namespace table: guest-side cache of adapter descriptors,
//! independent of container lifetime. Adapters are keyed by namespace,
//! not by container, so a namespace created before any container
//! claims it still has somewhere to live.

use std::path::PathBuf;

use gcs_shared::protocol::NetworkAdapterSettings;

#[derive(Debug, Clone, Default)]
pub struct NamespaceRecord {
    pub adapters: Vec<NetworkAdapterSettings>,
    pub resolv_conf_path: Option<PathBuf>,
}

impl NamespaceRecord {
    pub fn add_adapter(&mut self, adapter: NetworkAdapterSettings) {
        if !self.adapters.iter().any(|a| a.id == adapter.id) {
            self.adapters.push(adapter);
        }
    }

    /// Removes the adapter by id. Returns whether anything was removed;
    /// callers must still treat "nothing to remove" as success
    /// A no-op removal (nothing matched) is not treated as a failure.
    pub fn remove_adapter(&mut self, id: &str) -> bool {
        let before = self.adapters.len();
        self.adapters.retain(|a| a.id != id);
        self.adapters.len() != before
    }

    pub fn first_adapter(&self) -> Option<&NetworkAdapterSettings> {
        self.adapters.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(id: &str) -> NetworkAdapterSettings {
        NetworkAdapterSettings {
            id: id.to_string(),
            namespace_id: "ns1".to_string(),
            mac_address: String::new(),
            ip_address: String::new(),
            gateway: String::new(),
            dns_servers: vec![],
            dns_suffix: String::new(),
        }
    }

    #[test]
    fn add_adapter_is_idempotent_by_id() {
        let mut record = NamespaceRecord::default();
        record.add_adapter(adapter("a1"));
        record.add_adapter(adapter("a1"));
        assert_eq!(record.adapters.len(), 1);
    }

    #[test]
    fn remove_adapter_reports_whether_anything_changed() {
        let mut record = NamespaceRecord::default();
        record.add_adapter(adapter("a1"));
        assert!(record.remove_adapter("a1"));
        assert!(!record.remove_adapter("a1"), "second remove is a no-op, not a failure");
    }
}
