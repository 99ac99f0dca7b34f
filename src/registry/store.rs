use super::types::{ContainerName, LifecycleState, RuntimeRecord};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("error serializing registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("error persisting registry to `{path}`: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// In-memory map of managed containers mirrored to a JSON file.
///
/// The write lock is held only for the in-memory swap; file writes happen
/// outside of it, serialized by a dedicated mutex so concurrent writers
/// cannot interleave temp files. Readers of the file always see either the
/// pre- or post-image (sibling temp file + rename).
pub struct RuntimeRegistry {
    records: RwLock<HashMap<ContainerName, RuntimeRecord>>,
    persist_lock: Mutex<()>,
    path: PathBuf,
}

impl RuntimeRegistry {
    /// Loads the registry from `path`. A missing file yields an empty
    /// registry; a corrupt file is quarantined (renamed aside) and an empty
    /// registry is started. Neither case is fatal.
    pub fn load(path: &Path) -> Self {
        let records = match std::fs::read_to_string(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted registry, starting empty");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error_msg = %e, "cannot read persisted registry, starting empty");
                HashMap::new()
            }
            Ok(raw) => match serde_json::from_str::<HashMap<ContainerName, RuntimeRecord>>(&raw) {
                Ok(records) => records,
                Err(e) => {
                    let quarantined = quarantine_path(path);
                    warn!(
                        path = %path.display(),
                        quarantined = %quarantined.display(),
                        error_msg = %e,
                        "persisted registry is corrupt, quarantining and starting empty"
                    );
                    if let Err(rename_err) = std::fs::rename(path, &quarantined) {
                        warn!(error_msg = %rename_err, "could not quarantine corrupt registry file");
                    }
                    HashMap::new()
                }
            },
        };

        Self {
            records: RwLock::new(records),
            persist_lock: Mutex::new(()),
            path: path.to_path_buf(),
        }
    }

    /// Upserts a record and persists. A persistence failure leaves the
    /// in-memory state authoritative and is surfaced for logging only.
    pub fn put(&self, name: ContainerName, record: RuntimeRecord) -> Result<(), RegistryError> {
        self.records
            .write()
            .expect("registry lock poisoned")
            .insert(name, record);
        self.persist()
    }

    pub fn get(&self, name: &ContainerName) -> Option<RuntimeRecord> {
        self.records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &ContainerName) -> Result<(), RegistryError> {
        self.records
            .write()
            .expect("registry lock poisoned")
            .remove(name);
        self.persist()
    }

    /// Stable-ordered snapshot for background reconciliation.
    pub fn snapshot(&self) -> Vec<(ContainerName, RuntimeRecord)> {
        let mut entries: Vec<_> = self
            .records
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    /// Records the IP the container presented on its internal network.
    pub fn set_internal_ip(
        &self,
        name: &ContainerName,
        internal_ip: Option<String>,
    ) -> Result<(), RegistryError> {
        if let Some(record) = self
            .records
            .write()
            .expect("registry lock poisoned")
            .get_mut(name)
        {
            record.internal_ip = internal_ip;
        }
        self.persist()
    }

    /// In-memory only: lifecycle state is not part of the persisted format.
    pub fn set_state(&self, name: &ContainerName, state: LifecycleState) {
        if let Some(record) = self
            .records
            .write()
            .expect("registry lock poisoned")
            .get_mut(name)
        {
            record.state = state;
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) -> Result<(), RegistryError> {
        // Serialize from a clone so the read lock is not held across file IO.
        let snapshot: BTreeMap<ContainerName, RuntimeRecord> = self
            .records
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        let serialized = serde_json::to_string_pretty(&snapshot)?;

        let _guard = self.persist_lock.lock().expect("persist lock poisoned");
        let tmp_path = self.path.with_extension("json.tmp");
        let write_and_rename = || -> std::io::Result<()> {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(serialized.as_bytes())?;
            tmp.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)
        };
        write_and_rename().map_err(|source| RegistryError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut quarantined = path.as_os_str().to_os_string();
    quarantined.push(format!(".corrupt-{}", chrono::Utc::now().timestamp()));
    PathBuf::from(quarantined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::{NetworkMode, VnicConfig};

    fn dhcp_vnic(parent: &str) -> VnicConfig {
        VnicConfig {
            name: "eth0".to_string(),
            parent_interface: parent.to_string(),
            mode: NetworkMode::Dhcp,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: None,
            subnet: None,
            gateway: None,
            dns: vec![],
            mac_address: None,
        }
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::load(&dir.path().join("runtime_vnics.json"));
        let name = ContainerName::new("plc-001").unwrap();

        registry
            .put(name.clone(), RuntimeRecord::new(vec![dhcp_vnic("ens37")]))
            .unwrap();
        assert_eq!(registry.get(&name).unwrap().vnics.len(), 1);

        registry.remove(&name).unwrap();
        assert!(registry.get(&name).is_none());
    }

    #[test]
    fn state_survives_restart_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_vnics.json");
        let name = ContainerName::new("plc-001").unwrap();

        {
            let registry = RuntimeRegistry::load(&path);
            registry
                .put(name.clone(), RuntimeRecord::new(vec![dhcp_vnic("ens37")]))
                .unwrap();
            registry
                .set_internal_ip(&name, Some("172.28.0.2".to_string()))
                .unwrap();
        }

        let reloaded = RuntimeRegistry::load(&path);
        let record = reloaded.get(&name).unwrap();
        assert_eq!(record.vnics[0].parent_interface, "ens37");
        assert_eq!(record.internal_ip.as_deref(), Some("172.28.0.2"));
        assert_eq!(record.state, LifecycleState::Running);
    }

    #[test]
    fn missing_file_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::load(&dir.path().join("does-not-exist.json"));
        assert!(registry.is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn corrupt_file_is_quarantined_and_writes_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_vnics.json");
        std::fs::write(&path, "{not json at all").unwrap();

        let registry = RuntimeRegistry::load(&path);
        assert!(registry.is_empty());
        assert!(logs_contain("quarantining"));

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);

        let name = ContainerName::new("plc-001").unwrap();
        registry
            .put(name.clone(), RuntimeRecord::new(vec![]))
            .unwrap();
        assert!(RuntimeRegistry::load(&path).get(&name).is_some());
    }

    #[test]
    fn snapshot_order_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::load(&dir.path().join("runtime_vnics.json"));
        for name in ["plc-b", "plc-a", "plc-c"] {
            registry
                .put(
                    ContainerName::new(name).unwrap(),
                    RuntimeRecord::new(vec![]),
                )
                .unwrap();
        }
        let names: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        assert_eq!(names, vec!["plc-a", "plc-b", "plc-c"]);
    }

    #[test]
    fn persistence_failure_keeps_memory_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        // Point the registry file inside a path that cannot be created.
        let bogus = dir.path().join("missing-subdir").join("runtime_vnics.json");
        let registry = RuntimeRegistry::load(&bogus);
        let name = ContainerName::new("plc-001").unwrap();

        let result = registry.put(name.clone(), RuntimeRecord::new(vec![]));
        assert!(result.is_err());
        assert!(registry.get(&name).is_some());
    }
}
