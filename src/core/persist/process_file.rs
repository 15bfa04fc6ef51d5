// src/core/persist/process_file.rs

//! The Process Status File: the on-disk serialization of the node
//! registry used for crash recovery. Writes happen under an exclusive
//! `flock` on a sidecar lock file and land via temp-file + rename, so a
//! reader at any instant sees either the pre-image or the post-image.

use crate::config::{STRICT_FILE_MODE, check_file_mode};
use crate::core::errors::ControllerError;
use crate::core::persist::file_lock::FileLockGuard;
use crate::core::status::StoreSnapshot;
use crate::core::types::{MAX_GROUPS, MAX_NODES_PER_GROUP, MAX_TOTAL_NODES, NodeInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Worker slot capacity never exceeds this; a larger value in the file
/// means the document does not describe this fleet.
const MAX_SLOTS: u64 = 5000;

/// One node record, live or faulty, in the status file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PersistedNode {
    #[serde(flatten)]
    pub node: NodeInfo,
    pub is_faulty: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub faulty_reason: String,
}

/// The full persisted document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessStatusDoc {
    pub server: Vec<PersistedNode>,
    pub instance_start_id_number: u64,
    /// Written by a separate fault-tracking subsystem; carried through
    /// verbatim on every write.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub processed_switch_faults: serde_json::Value,
}

impl ProcessStatusDoc {
    /// Builds the document from a registry snapshot and the current ID
    /// counter.
    pub fn from_snapshot(snapshot: &StoreSnapshot, instance_start_id_number: u64) -> Self {
        let mut server: Vec<PersistedNode> = snapshot
            .live
            .values()
            .map(|node| PersistedNode {
                node: node.clone(),
                is_faulty: false,
                faulty_reason: String::new(),
            })
            .collect();
        server.extend(snapshot.faulty.values().map(|entry| PersistedNode {
            node: entry.node.clone(),
            is_faulty: true,
            faulty_reason: entry.reason.clone(),
        }));
        Self {
            server,
            instance_start_id_number,
            processed_switch_faults: serde_json::Value::Null,
        }
    }

    /// Semantic validation, the same rules live ingestion applies.
    pub fn validate(&self) -> Result<(), ControllerError> {
        let err = |msg: String| Err(ControllerError::PersistFailure(msg));
        if self.server.len() > MAX_TOTAL_NODES {
            return err(format!(
                "status file lists {} nodes, more than the {MAX_TOTAL_NODES} supported",
                self.server.len()
            ));
        }
        let mut groups = BTreeSet::new();
        for record in &self.server {
            let node = &record.node;
            if node.ip.parse::<std::net::IpAddr>().is_err() {
                return err(format!("node {} has invalid IP '{}'", node.id, node.ip));
            }
            if node.peers.len() > MAX_NODES_PER_GROUP {
                return err(format!("node {} has an oversized peer list", node.id));
            }
            if node.static_info.total_slots_num > MAX_SLOTS {
                return err(format!(
                    "node {} reports {} slots, more than the {MAX_SLOTS} supported",
                    node.id, node.static_info.total_slots_num
                ));
            }
            groups.insert(node.static_info.group_id);
        }
        if groups.len() > MAX_GROUPS {
            return err(format!(
                "status file spans {} groups, more than the {MAX_GROUPS} supported",
                groups.len()
            ));
        }
        Ok(())
    }
}

/// Reads and writes the status file at a fixed path.
pub struct ProcessStatusFile {
    path: PathBuf,
    strict: bool,
}

impl ProcessStatusFile {
    pub fn new(path: PathBuf, strict: bool) -> Self {
        Self { path, strict }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Reads the file under the lock. An absent file is `Ok(None)`; an
    /// unreadable or invalid one is an error the caller logs and ignores
    /// (recovery must never crash the controller).
    pub fn load(&self) -> Result<Option<ProcessStatusDoc>, ControllerError> {
        if !self.path.exists() {
            debug!("no process status file at {}", self.path.display());
            return Ok(None);
        }
        let _lock = FileLockGuard::acquire(&self.lock_path())?;
        if self.strict {
            check_file_mode(&self.path, STRICT_FILE_MODE)
                .map_err(|e| ControllerError::PersistFailure(e.to_string()))?;
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            ControllerError::PersistFailure(format!(
                "failed to read '{}': {e}",
                self.path.display()
            ))
        })?;
        let doc: ProcessStatusDoc = serde_json::from_str(&contents).map_err(|e| {
            ControllerError::PersistFailure(format!(
                "'{}' does not match the status schema: {e}",
                self.path.display()
            ))
        })?;
        doc.validate()?;
        info!(
            "loaded process status file: {} nodes, next ordinal {}",
            doc.server.len(),
            doc.instance_start_id_number
        );
        Ok(Some(doc))
    }

    /// Writes the document under the lock: merge the opaque
    /// `processed_switch_faults` field back from the current file, write
    /// the temp file, then rename over the target.
    pub fn save(&self, mut doc: ProcessStatusDoc) -> Result<(), ControllerError> {
        let _lock = FileLockGuard::acquire(&self.lock_path())?;

        if self.path.exists() {
            match fs::read_to_string(&self.path)
                .ok()
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            {
                Some(existing) => {
                    if let Some(faults) = existing.get("processed_switch_faults") {
                        doc.processed_switch_faults = faults.clone();
                    }
                }
                None => warn!(
                    "existing status file '{}' is unreadable; not carrying fault records over",
                    self.path.display()
                ),
            }
        }

        let rendered = serde_json::to_string_pretty(&doc)
            .map_err(|e| ControllerError::PersistFailure(format!("serialization failed: {e}")))?;
        let tmp_path = self.tmp_path();
        write_mode_0640(&tmp_path, rendered.as_bytes()).map_err(|e| {
            ControllerError::PersistFailure(format!(
                "failed to write '{}': {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            ControllerError::PersistFailure(format!(
                "failed to rename '{}' into place: {e}",
                tmp_path.display()
            ))
        })?;
        debug!(
            "persisted {} node records to {}",
            doc.server.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(unix)]
fn write_mode_0640(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o640)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_mode_0640(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}
