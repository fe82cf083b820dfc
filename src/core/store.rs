//! Rule list storage and preset file persistence
//!
//! Preset files are indented JSON arrays. Every element carries a
//! `SourceApplication` tag; a file is only accepted when at least one
//! element carries [`SOURCE_APPLICATION`].

use crate::core::error::{Error, Result};
use crate::core::mapping::{MAX_RULES, PortMappingRule, Protocol};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Origin tag written into every saved element
pub const SOURCE_APPLICATION: &str = "UPnP_Manager";

/// On-disk shape of one preset element
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PresetRecord {
    #[serde(default)]
    port_name: Option<String>,
    #[serde(default)]
    port_number: i64,
    #[serde(default)]
    port_type: Option<String>,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    source_application: Option<String>,
}

impl PresetRecord {
    /// Converts a well-formed rule into a record; incomplete rows yield `None`.
    fn from_rule(rule: &PortMappingRule) -> Option<Self> {
        let key = rule.mapping_key()?;
        Some(Self {
            port_name: Some(rule.name.clone()),
            port_number: i64::from(key.port),
            port_type: Some(key.protocol.as_str().to_string()),
            is_active: rule.active,
            source_application: Some(SOURCE_APPLICATION.to_string()),
        })
    }

    /// Out-of-range ports and unknown protocol names load as incomplete rows.
    fn into_rule(self) -> PortMappingRule {
        PortMappingRule {
            name: self.port_name.unwrap_or_default(),
            port: u16::try_from(self.port_number).ok().filter(|p| *p != 0),
            protocol: self
                .port_type
                .as_deref()
                .and_then(|t| t.trim().parse::<Protocol>().ok()),
            active: self.is_active,
        }
    }
}

/// A single edit to the rule list, as produced by the presentation shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEdit {
    Add(PortMappingRule),
    Remove(usize),
    Update(usize, PortMappingRule),
}

/// Ordered, editable collection of port-mapping rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleStore {
    rules: Vec<PortMappingRule>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: Vec<PortMappingRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PortMappingRule] {
        &self.rules
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PortMappingRule> {
        self.rules.iter()
    }

    pub fn get(&self, index: usize) -> Option<&PortMappingRule> {
        self.rules.get(index)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Appends a rule to the end of the list.
    pub fn add(&mut self, rule: PortMappingRule) {
        self.rules.push(rule);
    }

    /// Removes and returns the rule at `index`, or `None` if out of range.
    pub fn remove(&mut self, index: usize) -> Option<PortMappingRule> {
        (index < self.rules.len()).then(|| self.rules.remove(index))
    }

    /// Replaces the rule at `index`. Returns false if out of range.
    pub fn update(&mut self, index: usize, rule: PortMappingRule) -> bool {
        match self.rules.get_mut(index) {
            Some(slot) => {
                *slot = rule;
                true
            }
            None => false,
        }
    }

    /// Applies one edit. Returns false when the edit's index was out of range.
    pub fn apply_edit(&mut self, edit: RuleEdit) -> bool {
        match edit {
            RuleEdit::Add(rule) => {
                self.add(rule);
                true
            }
            RuleEdit::Remove(index) => self.remove(index).is_some(),
            RuleEdit::Update(index, rule) => self.update(index, rule),
        }
    }

    /// Rules with both a valid port and a protocol, in list order.
    pub fn well_formed(&self) -> impl Iterator<Item = &PortMappingRule> {
        self.rules.iter().filter(|r| r.is_well_formed())
    }

    /// Parses preset file content into rules without touching any store.
    ///
    /// # Errors
    ///
    /// - [`Error::Format`] if the content is not a JSON preset array or is too large
    /// - [`Error::OriginMismatch`] if no element was saved by this tool
    pub fn parse(json: &str) -> Result<Vec<PortMappingRule>> {
        let records: Vec<PresetRecord> =
            serde_json::from_str(json).map_err(|e| Error::Format(e.to_string()))?;

        if records.len() > MAX_RULES {
            return Err(Error::Format(format!(
                "file contains {} presets (max: {MAX_RULES})",
                records.len()
            )));
        }

        if !records
            .iter()
            .any(|r| r.source_application.as_deref() == Some(SOURCE_APPLICATION))
        {
            return Err(Error::OriginMismatch);
        }

        Ok(records.into_iter().map(PresetRecord::into_rule).collect())
    }

    /// Serializes the well-formed rules as indented preset JSON.
    pub fn to_json(&self) -> Result<String> {
        let records: Vec<PresetRecord> = self.rules.iter().filter_map(PresetRecord::from_rule).collect();
        serde_json::to_string_pretty(&records).map_err(|e| Error::Format(e.to_string()))
    }

    /// Replaces the store's contents with the rules in `path`.
    ///
    /// On any error the store is left unchanged.
    ///
    /// # Async
    /// Uses `tokio::fs` for non-blocking file I/O.
    pub async fn load(&mut self, path: &Path) -> Result<usize> {
        let json = tokio::fs::read_to_string(path).await?;

        let rules = match Self::parse(&json) {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Rejected rule file {}: {e}", path.display());
                return Err(e);
            }
        };

        let skipped = rules.iter().filter(|r| !r.is_well_formed()).count();
        if skipped > 0 {
            warn!(
                "{skipped} preset(s) in {} are incomplete and will not be applied",
                path.display()
            );
        }

        self.rules = rules;
        info!("Loaded {} rules from {}", self.rules.len(), path.display());
        Ok(self.rules.len())
    }

    /// Writes the well-formed rules to `path`, replacing its contents.
    /// Uses a temporary file + rename so a crash mid-write cannot leave a
    /// truncated preset file behind.
    ///
    /// Returns the number of rules written.
    ///
    /// # Async
    /// Uses `tokio::fs` for non-blocking file I/O.
    pub async fn save(&self, path: &Path) -> Result<usize> {
        let json = self.to_json()?;
        let written = self.well_formed().count();

        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o644)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&temp_path, &json).await?;
        }

        tokio::fs::rename(&temp_path, path).await?;

        info!("Saved {written} rules to {}", path.display());
        Ok(written)
    }
}
