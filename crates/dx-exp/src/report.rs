use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use dx_core::errors::{DxError, ErrorInfo};
use serde::{Deserialize, Serialize};

use crate::fanout::CommandResult;
use crate::grid::ParameterBinding;
use crate::registry::ExperimentShape;
use crate::serde::{from_json_slice, to_canonical_json_bytes};

/// File name used when persisting a [`RunReport`].
pub const REPORT_FILE: &str = "run_report.json";

fn io_error(code: &str, path: &Path, err: impl ToString) -> DxError {
    DxError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// State enumeration for a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// The body returned a non-restart signal.
    Complete,
    /// The instance ended the run (abort, raise_on_rc, exhausted retries, error).
    Failed,
}

/// Canonical report entry for one (experiment, binding) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub index: usize,
    /// Stable hash of experiment name and binding.
    pub instance_id: String,
    pub binding: ParameterBinding,
    /// Attempts used, counting the final one.
    pub attempts: u32,
    pub state: InstanceState,
    pub started_at: String,
    pub finished_at: String,
    /// Commands of the final attempt, with captured output when enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Per-experiment section of a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub name: String,
    pub shape: ExperimentShape,
    pub targets: Vec<String>,
    pub instances: Vec<InstanceReport>,
}

impl ExperimentReport {
    pub fn total_attempts(&self) -> u32 {
        self.instances.iter().map(|instance| instance.attempts).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.instances
            .iter()
            .all(|instance| instance.state == InstanceState::Complete)
    }
}

/// Everything a run did, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
    pub created_at: String,
    pub experiments: Vec<ExperimentReport>,
    /// Fatal condition that stopped the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DxError>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            plan_hash: None,
            created_at: timestamp(),
            experiments: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn experiment(&self, name: &str) -> Option<&ExperimentReport> {
        self.experiments.iter().find(|exp| exp.name == name)
    }

    /// Converts a report carrying a fatal error into that error.
    pub fn into_result(self) -> Result<RunReport, DxError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Writes canonical JSON to `out/run_report.json`.
    pub fn persist(&self, out: &Path) -> Result<PathBuf, DxError> {
        fs::create_dir_all(out).map_err(|err| io_error("report.out_dir", out, err))?;
        let path = out.join(REPORT_FILE);
        let bytes = to_canonical_json_bytes(self)?;
        fs::write(&path, bytes).map_err(|err| io_error("report.write", &path, err))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, DxError> {
        let bytes = fs::read(path).map_err(|err| io_error("report.read", path, err))?;
        from_json_slice(&bytes)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
