//! Failure signature matching

use std::collections::HashMap;

use regex::{Regex, RegexSet};
use tracing::debug;

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::catalogue::{
    CatalogueFile, Category, Classification, PatternSpec, RecoveryAction, RecoveryRef, Severity,
};

/// Catalogue compiled into the binary, used when no file is given
pub const DEFAULT_CATALOGUE: &str = include_str!("../../catalogues/default_patterns.json");

#[derive(Debug, Clone)]
struct CompiledPattern {
    label: String,
    catalogue_index: usize,
    regex: Regex,
    category: Category,
    severity: Severity,
    priority: i64,
    recovery_ref: String,
}

/// Ordered, immutable pattern catalogue.
///
/// Patterns are evaluated by ascending priority with ties resolved by their
/// position in the catalogue file; the first match wins.
#[derive(Debug, Clone)]
pub struct Matcher {
    patterns: Vec<CompiledPattern>,
    set: RegexSet,
    actions: HashMap<String, RecoveryAction>,
}

impl Matcher {
    pub fn from_catalogue(catalogue: CatalogueFile) -> Result<Self, EngineError> {
        let mut actions = HashMap::new();
        for action in catalogue.recovery_actions {
            if action.commands.is_empty() {
                return Err(EngineError::ValidationError(format!(
                    "recovery action {:?} has no commands",
                    action.id
                )));
            }
            if actions.insert(action.id.clone(), action.clone()).is_some() {
                return Err(EngineError::ValidationError(format!(
                    "duplicate recovery action {:?}",
                    action.id
                )));
            }
        }

        let mut patterns = Vec::with_capacity(catalogue.patterns.len());
        for (index, spec) in catalogue.patterns.into_iter().enumerate() {
            patterns.push(compile_pattern(index, spec, &mut actions)?);
        }

        // Stable: equal priorities keep catalogue order
        patterns.sort_by_key(|p| p.priority);

        let set = RegexSet::new(patterns.iter().map(|p| p.regex.as_str()))?;
        debug!("Compiled {} failure patterns", patterns.len());

        Ok(Self {
            patterns,
            set,
            actions,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let catalogue: CatalogueFile = serde_json::from_str(json)
            .map_err(|e| EngineError::ValidationError(format!("invalid pattern catalogue: {}", e)))?;
        Self::from_catalogue(catalogue)
    }

    pub fn builtin() -> Result<Self, EngineError> {
        Self::from_json(DEFAULT_CATALOGUE)
    }

    /// Load a catalogue file, or the built-in one when `file` is `None`
    pub async fn load(file: Option<&File>) -> Result<Self, EngineError> {
        match file {
            Some(file) => {
                let json = file.read_string().await.map_err(|e| {
                    EngineError::ValidationError(format!(
                        "unable to read pattern catalogue {:?}: {}",
                        file.path(),
                        e
                    ))
                })?;
                Self::from_json(&json)
            }
            None => Self::builtin(),
        }
    }

    /// Classify one output line, `None` when no pattern matches
    pub fn classify(&self, line: &str) -> Option<Classification> {
        let index = self.set.matches(line).into_iter().next()?;
        let pattern = &self.patterns[index];
        Some(Classification {
            pattern: pattern.label.clone(),
            pattern_index: pattern.catalogue_index,
            category: pattern.category,
            severity: pattern.severity,
            priority: pattern.priority,
            recovery_ref: pattern.recovery_ref.clone(),
        })
    }

    pub fn action(&self, id: &str) -> Option<&RecoveryAction> {
        self.actions.get(id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn compile_pattern(
    index: usize,
    spec: PatternSpec,
    actions: &mut HashMap<String, RecoveryAction>,
) -> Result<CompiledPattern, EngineError> {
    let label = spec.name.clone().unwrap_or_else(|| format!("pattern-{}", index));
    let regex = Regex::new(&spec.regex).map_err(|e| {
        EngineError::ValidationError(format!("pattern {} has an invalid regex: {}", label, e))
    })?;

    let recovery_ref = match spec.recovery {
        RecoveryRef::Named(id) => {
            if !actions.contains_key(&id) {
                return Err(EngineError::ValidationError(format!(
                    "pattern {} refers to unknown recovery action {:?}",
                    label, id
                )));
            }
            id
        }
        RecoveryRef::Inline { id, commands, note } => {
            if commands.is_empty() {
                return Err(EngineError::ValidationError(format!(
                    "pattern {} has an inline recovery action without commands",
                    label
                )));
            }
            let id = id.unwrap_or_else(|| format!("{}-recovery", label));
            if actions.contains_key(&id) {
                return Err(EngineError::ValidationError(format!(
                    "duplicate recovery action {:?}",
                    id
                )));
            }
            actions.insert(id.clone(), RecoveryAction {
                id: id.clone(),
                commands,
                note,
            });
            id
        }
    };

    Ok(CompiledPattern {
        label,
        catalogue_index: index,
        regex,
        category: spec.category,
        severity: spec.severity,
        priority: spec.priority,
        recovery_ref,
    })
}
