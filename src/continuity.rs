//! Session continuity: a summary an agent saves before it is released and
//! gets back when it comes up again.
//!
//! One JSON file per agent under the continuity directory:
//! `{dir}/{agent}.json`.

use crate::protocol::current_timestamp_ms;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persisted continuity state for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuityRecord {
    pub agent_name: String,
    #[serde(default)]
    pub summary: String,
    /// Open questions the agent flagged with `ACTION: uncertain`
    #[serde(default)]
    pub uncertainties: Vec<String>,
    #[serde(default)]
    pub saved_at: u64,
}

impl ContinuityRecord {
    /// Text injected into the agent when it asks to load its context
    pub fn render(&self) -> String {
        let mut text = format!("[Continuity] Saved context for {}:\n{}", self.agent_name, self.summary);
        if !self.uncertainties.is_empty() {
            text.push_str("\nOpen uncertainties:");
            for item in &self.uncertainties {
                text.push_str("\n- ");
                text.push_str(item);
            }
        }
        text
    }
}

pub trait ContinuityStore: Send + Sync {
    fn save(&self, agent: &str, summary: &str) -> Result<()>;

    fn load(&self, agent: &str) -> Result<Option<ContinuityRecord>>;

    /// Remember an open question next to the summary
    fn add_uncertainty(&self, agent: &str, note: &str) -> Result<()>;
}

/// JSON file per agent
#[derive(Debug, Clone)]
pub struct FileContinuityStore {
    dir: PathBuf,
}

impl FileContinuityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, agent: &str) -> PathBuf {
        let safe: String = agent
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    fn read(&self, agent: &str) -> Result<Option<ContinuityRecord>> {
        let path = self.path_for(agent);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read continuity file {:?}", path))?;
        let record = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid continuity file {:?}", path))?;
        Ok(Some(record))
    }

    fn write(&self, record: &ContinuityRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create continuity dir {:?}", self.dir))?;
        let path = self.path_for(&record.agent_name);
        // Readers only ever see a complete file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(record)?)
            .with_context(|| format!("Failed to write continuity file {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move continuity file into {:?}", path))?;
        debug!("Continuity written to {:?}", path);
        Ok(())
    }
}

impl ContinuityStore for FileContinuityStore {
    fn save(&self, agent: &str, summary: &str) -> Result<()> {
        let mut record = self.read(agent)?.unwrap_or_else(|| ContinuityRecord {
            agent_name: agent.to_string(),
            ..Default::default()
        });
        record.summary = summary.trim().to_string();
        record.saved_at = current_timestamp_ms();
        self.write(&record)?;
        info!("Saved continuity for {} ({} bytes)", agent, record.summary.len());
        Ok(())
    }

    fn load(&self, agent: &str) -> Result<Option<ContinuityRecord>> {
        self.read(agent)
    }

    fn add_uncertainty(&self, agent: &str, note: &str) -> Result<()> {
        let note = note.trim();
        if note.is_empty() {
            return Ok(());
        }
        let mut record = self.read(agent)?.unwrap_or_else(|| ContinuityRecord {
            agent_name: agent.to_string(),
            ..Default::default()
        });
        record.uncertainties.push(note.to_string());
        record.saved_at = current_timestamp_ms();
        self.write(&record)
    }
}
