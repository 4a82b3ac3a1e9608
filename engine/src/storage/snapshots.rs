//! Crash-safe session snapshots
//!
//! A snapshot is the single source of truth for resuming a session. Every save
//! replaces the previous one through [`File::write_atomic`], so after a crash
//! at any point the file on disk is either the last complete save or absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::filesys::file::{File, TEMP_SUFFIX};
use crate::models::session::DeploymentSession;
use crate::models::step::Step;
use crate::storage::layout::StorageLayout;
use crate::utils::sha256_hash;

/// Envelope format written by this engine
pub const FORMAT_VERSION: u32 = 1;

/// Full persisted state of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub engine_version: String,
    /// Bumped by every save
    pub sequence: u64,
    pub saved_at: DateTime<Utc>,
    pub session: DeploymentSession,
    pub steps: Vec<Step>,
}

impl StateSnapshot {
    pub fn new(session: DeploymentSession, steps: Vec<Step>) -> Self {
        Self {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            sequence: 0,
            saved_at: Utc::now(),
            session,
            steps,
        }
    }

    /// Index of the first step still needing work
    pub fn first_unfinished_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_done())
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    checksum: String,
    payload: serde_json::Value,
}

fn payload_checksum(payload: &serde_json::Value) -> Result<String, EngineError> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(sha256_hash(&bytes))
}

/// Reject ids that would escape the sessions directory
pub fn validate_session_id(id: &str) -> Result<(), EngineError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::ValidationError(format!(
            "invalid session id {:?}",
            id
        )))
    }
}

/// Snapshot persistence keyed by session id
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: StorageLayout,
}

impl StateStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Persist `snapshot`, bumping its sequence number and save time
    pub async fn save(&self, snapshot: &mut StateSnapshot) -> Result<(), EngineError> {
        let session_id = snapshot.session.id.clone();
        validate_session_id(&session_id)?;

        snapshot.sequence += 1;
        snapshot.saved_at = Utc::now();

        let payload = serde_json::to_value(&*snapshot)?;
        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            checksum: payload_checksum(&payload)?,
            payload,
        };

        self.sweep_temp_files(&session_id).await;
        self.layout
            .snapshot_file(&session_id)
            .write_json(&envelope)
            .await?;

        debug!(
            "Saved snapshot {} for session {}",
            snapshot.sequence, session_id
        );
        Ok(())
    }

    /// Load the last saved snapshot, `None` when the session has never been saved
    pub async fn load(&self, session_id: &str) -> Result<Option<StateSnapshot>, EngineError> {
        validate_session_id(session_id)?;
        let file = self.layout.snapshot_file(session_id);
        if !file.exists().await {
            return Ok(None);
        }

        let envelope: Envelope = file.read_json().await.map_err(|e| {
            warn!("Unreadable snapshot {:?}: {}", file.path(), e);
            EngineError::CorruptSnapshot(session_id.to_string())
        })?;

        if envelope.format_version > FORMAT_VERSION {
            return Err(EngineError::StorageError(format!(
                "snapshot of session {} has format version {}, newest supported is {}",
                session_id, envelope.format_version, FORMAT_VERSION
            )));
        }

        if payload_checksum(&envelope.payload)? != envelope.checksum {
            warn!("Checksum mismatch in {:?}", file.path());
            return Err(EngineError::CorruptSnapshot(session_id.to_string()));
        }

        let snapshot: StateSnapshot = serde_json::from_value(envelope.payload).map_err(|e| {
            warn!("Snapshot payload of {} does not decode: {}", session_id, e);
            EngineError::CorruptSnapshot(session_id.to_string())
        })?;
        Ok(Some(snapshot))
    }

    /// Ids of every session that has a snapshot
    pub async fn list(&self) -> Result<Vec<String>, EngineError> {
        let mut ids = Vec::new();
        for dir in self.layout.sessions_dir().list_dirs().await? {
            let Some(id) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if validate_session_id(id).is_ok() && self.layout.snapshot_file(id).exists().await {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Remove everything stored for a session
    pub async fn delete(&self, session_id: &str) -> Result<(), EngineError> {
        validate_session_id(session_id)?;
        self.layout.session_dir(session_id).delete().await
    }

    /// Remove temp files left behind by an interrupted save
    async fn sweep_temp_files(&self, session_id: &str) {
        let dir = self.layout.session_dir(session_id);
        if !dir.exists().await {
            return;
        }
        let files = match dir.list_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!("Unable to list {:?}: {}", dir.path(), e);
                return;
            }
        };

        for path in files {
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(".snapshot.json.") && n.ends_with(TEMP_SUFFIX))
                .unwrap_or(false);
            if is_temp {
                debug!("Removing stale temp file {:?}", path);
                if let Err(e) = File::new(path).delete().await {
                    warn!("Unable to remove stale temp file: {}", e);
                }
            }
        }
    }
}
