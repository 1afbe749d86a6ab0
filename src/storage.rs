//! On-disk layout of the engine root and of each map directory.
//!
//! ```text
//! <root>/tags/<tag>                 contains the map id
//! <root>/removed_tags/<id>          tag files of maps being removed
//! <root>/maps/<id>/submit.json
//! <root>/maps/<id>/num_components
//! <root>/maps/<id>/inputs/<i>.json
//! <root>/maps/<id>/outputs/<i>.json
//! <root>/maps/<id>/job_logs/<i>.stdout
//! <root>/maps/<id>/job_logs/<i>.stderr
//! <root>/maps/<id>/output_files/<i>/
//! <root>/maps/<id>/transient
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::MapId;

pub const TAGS_DIR: &str = "tags";
pub const REMOVED_TAGS_DIR: &str = "removed_tags";
pub const MAPS_DIR: &str = "maps";
pub const INPUTS_DIR: &str = "inputs";
pub const OUTPUTS_DIR: &str = "outputs";
pub const JOB_LOGS_DIR: &str = "job_logs";
pub const OUTPUT_FILES_DIR: &str = "output_files";
pub const SUBMIT_FILE: &str = "submit.json";
pub const NUM_COMPONENTS_FILE: &str = "num_components";
pub const TRANSIENT_MARKER: &str = "transient";

/// Persisted description of a submitted map. Edits and retags rewrite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSubmission {
    pub tag: String,
    pub command: String,
    pub request_memory_mb: u64,
    pub request_disk_kb: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub submitted_at: DateTime<Utc>,
}

/// What a failed component left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub runtime: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Contents of `outputs/<i>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum StoredOutcome {
    #[serde(rename = "OK")]
    Ok { output: String },
    #[serde(rename = "ERR")]
    Err { error: RawError },
}

/// Paths under the engine root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tags_dir(&self) -> PathBuf {
        self.root.join(TAGS_DIR)
    }

    pub fn removed_tags_dir(&self) -> PathBuf {
        self.root.join(REMOVED_TAGS_DIR)
    }

    pub fn maps_dir(&self) -> PathBuf {
        self.root.join(MAPS_DIR)
    }

    pub fn tag_file(&self, tag: &str) -> PathBuf {
        crate::tags::tag_file_path(&self.tags_dir(), tag)
    }

    pub fn removed_tag_file(&self, id: &MapId) -> PathBuf {
        self.removed_tags_dir().join(id.to_string())
    }

    pub fn map_dir(&self, id: &MapId) -> MapDir {
        MapDir::new(self.maps_dir().join(id.to_string()))
    }

    pub async fn ensure(&self) -> Result<()> {
        for dir in [self.tags_dir(), self.removed_tags_dir(), self.maps_dir()] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Paths and file I/O inside one map directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDir {
    path: PathBuf,
}

impl MapDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn submit_file(&self) -> PathBuf {
        self.path.join(SUBMIT_FILE)
    }

    pub fn transient_marker(&self) -> PathBuf {
        self.path.join(TRANSIENT_MARKER)
    }

    pub fn input_file(&self, component: usize) -> PathBuf {
        self.path.join(INPUTS_DIR).join(format!("{}.json", component))
    }

    pub fn output_file(&self, component: usize) -> PathBuf {
        self.path.join(OUTPUTS_DIR).join(format!("{}.json", component))
    }

    pub fn stdout_file(&self, component: usize) -> PathBuf {
        self.path.join(JOB_LOGS_DIR).join(format!("{}.stdout", component))
    }

    pub fn stderr_file(&self, component: usize) -> PathBuf {
        self.path.join(JOB_LOGS_DIR).join(format!("{}.stderr", component))
    }

    pub fn output_files_dir(&self, component: usize) -> PathBuf {
        self.path.join(OUTPUT_FILES_DIR).join(component.to_string())
    }

    /// Create the directory skeleton and write the submission and inputs.
    pub async fn create(&self, submission: &MapSubmission, inputs: &[Vec<String>]) -> Result<()> {
        for dir in [INPUTS_DIR, OUTPUTS_DIR, JOB_LOGS_DIR, OUTPUT_FILES_DIR] {
            tokio::fs::create_dir_all(self.path.join(dir)).await?;
        }
        self.save_submission(submission).await?;
        tokio::fs::write(
            self.path.join(NUM_COMPONENTS_FILE),
            inputs.len().to_string(),
        )
        .await?;
        for (component, args) in inputs.iter().enumerate() {
            tokio::fs::write(self.input_file(component), serde_json::to_vec(args)?).await?;
        }
        Ok(())
    }

    pub async fn save_submission(&self, submission: &MapSubmission) -> Result<()> {
        let json = serde_json::to_vec_pretty(submission)?;
        tokio::fs::write(self.submit_file(), json).await?;
        Ok(())
    }

    pub async fn load_submission(&self) -> Result<MapSubmission> {
        let bytes = tokio::fs::read(self.submit_file()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn load_num_components(&self) -> Result<usize> {
        let text = tokio::fs::read_to_string(self.path.join(NUM_COMPONENTS_FILE)).await?;
        text.trim().parse().map_err(|e| {
            crate::error::MapError::Internal(format!(
                "corrupt component count in {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    pub async fn load_input(&self, component: usize) -> Result<Vec<String>> {
        let bytes = tokio::fs::read(self.input_file(component)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn save_outcome(&self, component: usize, outcome: &StoredOutcome) -> Result<()> {
        let json = serde_json::to_vec(outcome)?;
        tokio::fs::write(self.output_file(component), json).await?;
        Ok(())
    }

    /// `None` if the component has not produced an output file yet.
    pub async fn load_outcome(&self, component: usize) -> Result<Option<StoredOutcome>> {
        match tokio::fs::read(self.output_file(component)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_logs(&self, component: usize, stdout: &str, stderr: &str) -> Result<()> {
        tokio::fs::write(self.stdout_file(component), stdout).await?;
        tokio::fs::write(self.stderr_file(component), stderr).await?;
        Ok(())
    }

    /// Delete everything a component produced so it can run again.
    pub async fn clear_component(&self, component: usize) -> Result<()> {
        for file in [
            self.output_file(component),
            self.stdout_file(component),
            self.stderr_file(component),
        ] {
            remove_file_if_exists(&file).await?;
        }
        match tokio::fs::remove_dir_all(self.output_files_dir(component)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient_marker().exists()
    }

    pub async fn mark_transient(&self) -> Result<()> {
        tokio::fs::write(self.transient_marker(), b"").await?;
        Ok(())
    }

    pub async fn mark_persistent(&self) -> Result<()> {
        remove_file_if_exists(&self.transient_marker()).await
    }
}

pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
