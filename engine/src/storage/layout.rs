//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Environment variable overriding the default state directory
pub const STATE_DIR_ENV: &str = "ROLLOUT_STATE_DIR";

/// Storage layout for the engine
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Directory holding one subdirectory per session
    pub fn sessions_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("sessions"))
    }

    /// Directory owned by a single session
    pub fn session_dir(&self, session_id: &str) -> Dir {
        self.sessions_dir().subdir(session_id)
    }

    /// Snapshot file of a session
    pub fn snapshot_file(&self, session_id: &str) -> File {
        self.session_dir(session_id).file("snapshot.json")
    }

    /// Append-only execution log of a session
    pub fn execution_log_file(&self, session_id: &str) -> File {
        self.session_dir(session_id).file("execution.log")
    }

    /// Directory receiving failure reports written by the file reporter
    pub fn reports_dir(&self, session_id: &str) -> Dir {
        self.session_dir(session_id).subdir("reports")
    }

    /// Directory holding ssh control sockets
    pub fn ssh_control_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("ssh"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), EngineError> {
        self.sessions_dir().create().await?;
        self.ssh_control_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
            return Self::new(dir);
        }

        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/rollout");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rollout");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
