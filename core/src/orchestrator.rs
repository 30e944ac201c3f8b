//! The two-stage install/execute state machine. Every run ends in a
//! dispatch: collect highlights, build attachments, post the summary, then
//! delete every temporary artifact the run produced, on every exit path.

use std::fs;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::audit::AuditCollector;
use crate::audit::Stage;
use crate::audit::middle_truncate;
use crate::compress::gzip_file;
use crate::paths;
use crate::protocol::AuditHighlights;
use crate::protocol::ExecutionSummary;
use crate::protocol::InstallOutcome;
use crate::protocol::JobHandler;
use crate::protocol::PackageInstaller;
use crate::protocol::RunJob;
use crate::protocol::RunMode;
use crate::protocol::SandboxExecutor;
use crate::protocol::WebhookClient;
use crate::protocol::WebhookSummary;
use crate::report::build_html_report;

const FAILURE_TAIL_LINES: usize = 6;
const FAILURE_SUMMARY_CAP: usize = 350;

const HINT_CLONE: &str = "hint: nsjail namespace clone blocked by container runtime; \
allow user namespaces (seccomp=unconfined / privileged) or run on a host kernel";
const HINT_CGROUP: &str = "hint: nsjail cgroup namespace init failed; \
disable the cgroup pids limit or delegate cgroup v2 controllers";
const HINT_EXECVE: &str = "hint: nsjail could not exec the requested binary; \
verify the chroot/mounts include /usr, /bin, /lib, /lib64";

pub struct TriageOrchestrator {
    installer: Arc<dyn PackageInstaller>,
    sandbox: Arc<dyn SandboxExecutor>,
    webhook: Arc<dyn WebhookClient>,
}

struct DispatchInput {
    ok: bool,
    message: String,
    timed_out: bool,
    stdout_bytes: usize,
    stderr_bytes: usize,
    install_audit: Option<PathBuf>,
    sandbox_audit: Option<PathBuf>,
}

impl TriageOrchestrator {
    pub fn new(
        installer: Arc<dyn PackageInstaller>,
        sandbox: Arc<dyn SandboxExecutor>,
        webhook: Arc<dyn WebhookClient>,
    ) -> Self {
        Self {
            installer,
            sandbox,
            webhook,
        }
    }

    pub async fn execute(&self, job: &RunJob) -> ExecutionSummary {
        let install = self.installer.install(job).await;

        if !install.ok {
            let message = format!("pip install failed: {}", summarize_install_failure(&install));
            return self
                .dispatch(
                    job,
                    DispatchInput {
                        ok: false,
                        message,
                        timed_out: false,
                        stdout_bytes: 0,
                        stderr_bytes: 0,
                        install_audit: install.audit_jsonl_path,
                        sandbox_audit: None,
                    },
                )
                .await;
        }

        if job.mode == RunMode::Install {
            return self
                .dispatch(
                    job,
                    DispatchInput {
                        ok: true,
                        message: "install ok".to_string(),
                        timed_out: false,
                        stdout_bytes: 0,
                        stderr_bytes: 0,
                        install_audit: install.audit_jsonl_path,
                        sandbox_audit: None,
                    },
                )
                .await;
        }

        let sandbox = self.sandbox.run(job).await;
        let outcome = if sandbox.ok { "ok" } else { "failed" };
        let timeout_note = if sandbox.timed_out { " (timed out)" } else { "" };
        let message = format!(
            "run {outcome}{timeout_note}; stdout={}B stderr={}B",
            sandbox.stdout.len(),
            sandbox.stderr.len()
        );
        self.dispatch(
            job,
            DispatchInput {
                ok: sandbox.ok,
                message,
                timed_out: sandbox.timed_out,
                stdout_bytes: sandbox.stdout.len(),
                stderr_bytes: sandbox.stderr.len(),
                install_audit: install.audit_jsonl_path,
                sandbox_audit: sandbox.audit_jsonl_path,
            },
        )
        .await
    }

    async fn dispatch(&self, job: &RunJob, input: DispatchInput) -> ExecutionSummary {
        let mut collector = AuditCollector::new();
        let sources = [
            (Stage::Install, input.install_audit.as_deref()),
            (Stage::Sandbox, input.sandbox_audit.as_deref()),
        ];
        for (stage, path) in sources {
            let Some(path) = path else { continue };
            if !path.is_file() {
                tracing::warn!(
                    "audit file missing run_id={} stage={} path={}",
                    job.run_id,
                    stage.label(),
                    path.display()
                );
                continue;
            }
            if let Err(err) = collector.ingest_file(stage, path) {
                tracing::warn!(
                    "audit ingest failed run_id={} stage={} path={}: {err}",
                    job.run_id,
                    stage.label(),
                    path.display()
                );
            }
        }
        let highlights = collector.finish();

        // Every path that might exist at the end of the run; cleanup sweeps
        // them all regardless of which branches ran.
        let mut doomed: Vec<PathBuf> = Vec::new();
        doomed.extend(input.install_audit.clone());
        doomed.extend(input.sandbox_audit.clone());
        doomed.push(paths::merged_audit_path(&job.run_id));

        let telemetry = self.build_telemetry_attachment(job, &input);
        let mut attachments: Vec<PathBuf> = Vec::new();
        if let Some(gz) = &telemetry {
            attachments.push(gz.clone());
        }

        if !highlights.is_empty() {
            let report_path = paths::report_path(&job.run_id);
            let html =
                build_html_report(job, &input.message, input.ok, input.timed_out, &highlights);
            match fs::write(&report_path, html) {
                Ok(()) => attachments.push(report_path.clone()),
                Err(err) => tracing::warn!(
                    "report write failed run_id={} path={}: {err}",
                    job.run_id,
                    report_path.display()
                ),
            }
            doomed.push(report_path);
        }

        let summary_record = build_webhook_summary(job, &input, &highlights);
        if let Err(err) = self.webhook.send(&summary_record, &attachments).await {
            tracing::warn!("webhook dispatch failed run_id={}: {err}", job.run_id);
        }

        doomed.extend(attachments);
        cleanup(&job.run_id, &doomed);

        ExecutionSummary {
            run_id: job.run_id.clone(),
            ok: input.ok,
            message: input.message,
            attachment_path: telemetry,
        }
    }

    /// Merges or gzips the raw audit files into a single `.gz` attachment.
    /// The raw inputs are consumed (deleted) by the step that uses them; any
    /// I/O failure degrades to "no telemetry attachment".
    fn build_telemetry_attachment(&self, job: &RunJob, input: &DispatchInput) -> Option<PathBuf> {
        let install = input
            .install_audit
            .as_deref()
            .filter(|path| path.is_file());
        let sandbox = input
            .sandbox_audit
            .as_deref()
            .filter(|path| path.is_file());

        let to_compress: PathBuf = match (install, sandbox) {
            (Some(install), Some(sandbox)) => {
                let merged = paths::merged_audit_path(&job.run_id);
                if let Err(err) = merge_audits(install, sandbox, &merged) {
                    tracing::warn!("audit merge failed run_id={}: {err}", job.run_id);
                    return None;
                }
                for raw in [install, sandbox] {
                    if let Err(err) = fs::remove_file(raw) {
                        tracing::warn!(
                            "raw audit cleanup failed run_id={} path={}: {err}",
                            job.run_id,
                            raw.display()
                        );
                    }
                }
                merged
            }
            (Some(single), None) | (None, Some(single)) => single.to_path_buf(),
            (None, None) => return None,
        };

        match gzip_file(&to_compress) {
            Ok(gz) => Some(gz),
            Err(err) => {
                tracing::warn!(
                    "audit compression failed run_id={} path={}: {err}",
                    job.run_id,
                    to_compress.display()
                );
                None
            }
        }
    }
}

fn merge_audits(install: &Path, sandbox: &Path, merged: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(merged)?);
    for (stage, path) in [(Stage::Install, install), (Stage::Sandbox, sandbox)] {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            writeln!(out, "{}:{line}", stage.label())?;
        }
    }
    out.flush()
}

fn build_webhook_summary(
    job: &RunJob,
    input: &DispatchInput,
    highlights: &AuditHighlights,
) -> WebhookSummary {
    WebhookSummary {
        run_id: job.run_id.clone(),
        package_name: job.package_name.clone(),
        version: job.version.clone(),
        mode: job.mode,
        ok: input.ok,
        summary: input.message.clone(),
        timed_out: input.timed_out,
        stdout_bytes: input.stdout_bytes,
        stderr_bytes: input.stderr_bytes,
        file_path: job.file_path.clone(),
        entrypoint: job.entrypoint.clone(),
        module_name: job.module_name.clone(),
        files_written: highlights.files_written.clone(),
        files_read: highlights.files_read.clone(),
        network_connections: highlights.network_connections.clone(),
        subprocesses: highlights.subprocesses.clone(),
        top_events: highlights.top_events.clone(),
    }
}

fn cleanup(run_id: &str, doomed: &[PathBuf]) {
    for path in doomed {
        remove_quietly(run_id, path);
        // A compression step that died halfway can leave a partial sibling.
        let mut gz_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        gz_name.push(".gz");
        remove_quietly(run_id, &path.with_file_name(gz_name));
    }
}

fn remove_quietly(run_id: &str, path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                "temp cleanup failed run_id={run_id} path={}: {err}",
                path.display()
            );
        }
    }
}

/// Last 6 non-empty lines of stderr (stdout when stderr is blank), joined
/// with ` | ` and middle-truncated, plus a fixed remediation hint when the
/// raw output matches a known nsjail failure signature.
fn summarize_install_failure(install: &InstallOutcome) -> String {
    let raw = if install.stderr.trim().is_empty() {
        &install.stdout
    } else {
        &install.stderr
    };
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    let mut message = middle_truncate(&lines[start..].join(" | "), FAILURE_SUMMARY_CAP);

    if let Some(hint) = nsjail_failure_hint(raw) {
        message.push_str("; ");
        message.push_str(hint);
    }
    message
}

fn nsjail_failure_hint(raw: &str) -> Option<&'static str> {
    let lowered = raw.to_lowercase();
    let has = |needle: &str| lowered.contains(needle);

    if has("clone(") && has("operation not permitted") && has("couldn't launch the child process") {
        Some(HINT_CLONE)
    } else if has("couldn't initialize cgroup user namespace")
        && has("launching child process failed")
    {
        Some(HINT_CGROUP)
    } else if has("execve(")
        && has("no such file or directory")
        && has("couldn't launch the child process")
    {
        Some(HINT_EXECVE)
    } else {
        None
    }
}

/// The pool-facing handler. Nothing a run does may take the worker down;
/// panics are contained by the pool, everything else is folded into the
/// execution summary.
pub struct WorkerHandler {
    orchestrator: Arc<TriageOrchestrator>,
}

impl WorkerHandler {
    pub fn new(orchestrator: Arc<TriageOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for WorkerHandler {
    async fn handle(&self, job: RunJob) {
        let run_id = job.run_id.clone();
        let summary = self.orchestrator.execute(&job).await;
        tracing::info!(
            "triage run complete run_id={run_id} ok={} message={:?}",
            summary.ok,
            summary.message
        );
    }
}
