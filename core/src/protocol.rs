//! Data model shared across the triage pipeline plus the async seams the
//! orchestrator consumes. Everything here is plain data; behavior lives in
//! the component modules.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Install,
    Execute,
    ExecuteModule,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Install => "install",
            RunMode::Execute => "execute",
            RunMode::ExecuteModule => "execute_module",
        }
    }
}

/// One accepted triage request. Minted by the submission service, consumed
/// by exactly one worker, discarded after dispatch.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub run_id: String,
    pub package_name: String,
    pub version: String,
    pub mode: RunMode,
    pub file_path: Option<String>,
    pub entrypoint: Option<String>,
    pub module_name: Option<String>,
}

impl RunJob {
    pub fn new(run_id: impl Into<String>, package_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            package_name: package_name.into(),
            version: version.into(),
            mode: RunMode::Install,
            file_path: None,
            entrypoint: None,
            module_name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub audit_jsonl_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub audit_jsonl_path: Option<PathBuf>,
}

/// Orchestration result, surfaced for logging and tests. The attachment
/// path names a file that has already been deleted by the time this is
/// returned; it identifies what was uploaded, not what is on disk.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub ok: bool,
    pub message: String,
    pub attachment_path: Option<PathBuf>,
}

/// Semantic extraction over one or both audit streams. The four sets are
/// insertion-ordered, deduplicated and capped; entries carry their stage
/// prefix (`install: ` / `sandbox: `).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditHighlights {
    pub files_written: Vec<String>,
    pub files_read: Vec<String>,
    pub network_connections: Vec<String>,
    pub subprocesses: Vec<String>,
    pub top_events: Vec<String>,
}

impl AuditHighlights {
    pub fn is_empty(&self) -> bool {
        self.files_written.is_empty()
            && self.files_read.is_empty()
            && self.network_connections.is_empty()
            && self.subprocesses.is_empty()
            && self.top_events.is_empty()
    }
}

/// Everything the webhook dispatcher needs to render one run.
#[derive(Debug, Clone)]
pub struct WebhookSummary {
    pub run_id: String,
    pub package_name: String,
    pub version: String,
    pub mode: RunMode,
    pub ok: bool,
    pub summary: String,
    pub timed_out: bool,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub file_path: Option<String>,
    pub entrypoint: Option<String>,
    pub module_name: Option<String>,
    pub files_written: Vec<String>,
    pub files_read: Vec<String>,
    pub network_connections: Vec<String>,
    pub subprocesses: Vec<String>,
    pub top_events: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub queue_limit: usize,
    pub workers: usize,
}

/// Installs one package at one version into the run-scoped site directory
/// and reports the install audit when it could be captured. Failures are
/// folded into the outcome, never raised.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, job: &RunJob) -> InstallOutcome;
}

/// Runs the already-installed package under the configured sandbox mode.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn run(&self, job: &RunJob) -> SandboxOutcome;
}

/// Posts one summary with attachments. The orchestrator treats errors as
/// best-effort dispatch failures.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn send(&self, summary: &WebhookSummary, attachment_paths: &[PathBuf]) -> Result<()>;
}

/// Consumes one job end-to-end on a worker.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: RunJob);
}
