//! Failure signature catalogue models

use serde::{Deserialize, Serialize};

/// Failure category of a matched output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    DependencyConflict,
    Permission,
    Network,
    Certificate,
    ProcessCrash,
    DiskSpace,
    Configuration,
    ResourceBusy,
    Unknown,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DependencyConflict => "dependency-conflict",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Certificate => "certificate",
            Self::ProcessCrash => "process-crash",
            Self::DiskSpace => "disk-space",
            Self::Configuration => "configuration",
            Self::ResourceBusy => "resource-busy",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Remediation commands run before the next attempt of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub note: String,
}

/// How a pattern names its recovery action in a catalogue file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecoveryRef {
    /// Id of an entry in `recovery_actions`
    Named(String),

    /// Action defined in place
    Inline {
        #[serde(default)]
        id: Option<String>,
        commands: Vec<String>,
        #[serde(default)]
        note: String,
    },
}

/// One failure signature as written in a catalogue file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub regex: String,
    pub category: Category,
    pub severity: Severity,
    /// Lower values are evaluated first
    pub priority: i64,
    pub recovery: RecoveryRef,
}

/// Catalogue file layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueFile {
    #[serde(default)]
    pub recovery_actions: Vec<RecoveryAction>,
    pub patterns: Vec<PatternSpec>,
}

/// Result of matching one output line against the catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Pattern name, or its catalogue position when unnamed
    pub pattern: String,
    pub pattern_index: usize,
    pub category: Category,
    pub severity: Severity,
    pub priority: i64,
    /// Id of the recovery action the pattern points at
    pub recovery_ref: String,
}
