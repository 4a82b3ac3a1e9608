//! Application configuration options

use std::path::PathBuf;
use std::sync::Arc;

use crate::deploy::channel::{Channel, ChannelOptions};
use crate::deploy::escalation::{EscalationReporter, FileEscalationReporter};
use crate::deploy::executor::ManagerOptions;
use crate::deploy::local::LocalChannel;
use crate::deploy::ssh::SshChannel;
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::http::escalation::HttpEscalationReporter;
use crate::models::session::{Target, Transport};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::engine_host_name;

/// Resolved options shared by every command
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage configuration
    pub layout: StorageLayout,

    /// Settings read from the settings file
    pub settings: Settings,
}

impl AppOptions {
    /// Resolve the state directory and read the settings file
    pub async fn load(
        state_dir: Option<PathBuf>,
        config: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        let layout = match state_dir {
            Some(dir) => StorageLayout::new(dir),
            None => StorageLayout::default(),
        };
        let settings_file = match config {
            Some(path) => {
                let file = File::new(path);
                if !file.exists().await {
                    return Err(EngineError::ConfigError(format!(
                        "settings file {:?} does not exist",
                        file.path()
                    )));
                }
                file
            }
            None => layout.settings_file(),
        };
        let settings = Settings::load(&settings_file).await?;
        Ok(Self { layout, settings })
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            log_queue_capacity: self.settings.execution.log_queue_capacity,
            report_tail_lines: self.settings.execution.report_tail_lines,
            reported_by: engine_host_name(),
        }
    }

    pub fn channel(&self, target: &Target, transport: Transport) -> Arc<dyn Channel> {
        let options = ChannelOptions::from_settings(
            &self.settings.execution,
            self.settings.ssh.kill_grace_secs,
        );
        match transport {
            Transport::Local => Arc::new(LocalChannel::new(options)),
            Transport::Ssh => Arc::new(SshChannel::new(
                target.clone(),
                self.settings.ssh.clone(),
                self.layout.ssh_control_dir().path().to_path_buf(),
                options,
            )),
        }
    }

    /// Tracker reporter when an endpoint is configured, report files otherwise
    pub fn reporter(&self, session_id: &str) -> Result<Arc<dyn EscalationReporter>, EngineError> {
        let reporter: Arc<dyn EscalationReporter> =
            match HttpEscalationReporter::from_settings(&self.settings.escalation)? {
                Some(reporter) => Arc::new(reporter),
                None => Arc::new(FileEscalationReporter::new(
                    self.layout.reports_dir(session_id),
                )),
            };
        Ok(reporter)
    }
}
