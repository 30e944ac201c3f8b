//! Pip installer running under the same nsjail prefix as the sandbox
//! executor. Produces an install-stage audit JSONL and enforces the shared
//! download-cache byte cap post-hoc.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::exec::ProcessRunner;
use crate::paths;
use crate::protocol::InstallOutcome;
use crate::protocol::PackageInstaller;
use crate::protocol::RunJob;
use crate::sandbox::build_audit_hook_code;
use crate::sandbox::build_nsjail_prefix;
use crate::sandbox::jailed_python;
use crate::sandbox::minimal_process_env;

pub struct NsjailPipInstaller {
    runner: Arc<dyn ProcessRunner>,
    settings: Settings,
}

impl NsjailPipInstaller {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: Settings) -> Self {
        Self { runner, settings }
    }
}

#[async_trait]
impl PackageInstaller for NsjailPipInstaller {
    async fn install(&self, job: &RunJob) -> InstallOutcome {
        let audit_path = paths::install_audit_path(&job.run_id);
        let cache_dir = PathBuf::from(&self.settings.pip_cache_dir);
        let before_size = dir_size(&cache_dir);

        let mut command = build_nsjail_prefix(&self.settings);
        command.push("--".to_string());
        command.push(jailed_python(&self.settings));
        command.push("-c".to_string());
        command.push(build_pip_bootstrap(job, &audit_path, &self.settings));

        let env: HashMap<String, String> =
            minimal_process_env(&[("PIP_CACHE_DIR", self.settings.pip_cache_dir.as_str())]);
        let timeout = Duration::from_secs(self.settings.run_timeout_sec);

        let result = match self.runner.run(&command, timeout, &env).await {
            Ok(result) => result,
            Err(err) => {
                return InstallOutcome {
                    ok: false,
                    stdout: String::new(),
                    stderr: format!("failed to spawn installer: {err}"),
                    audit_jsonl_path: Some(audit_path),
                };
            }
        };

        if result.timed_out || result.returncode != 0 {
            return InstallOutcome {
                ok: false,
                stdout: result.stdout,
                stderr: result.stderr,
                audit_jsonl_path: Some(audit_path),
            };
        }

        let after_size = dir_size(&cache_dir);
        let delta = after_size.saturating_sub(before_size);
        if delta > self.settings.max_download_bytes {
            return InstallOutcome {
                ok: false,
                stdout: result.stdout,
                stderr: format!(
                    "download byte cap exceeded: wrote {delta} bytes, cap is {}",
                    self.settings.max_download_bytes
                ),
                audit_jsonl_path: Some(audit_path),
            };
        }

        InstallOutcome {
            ok: true,
            stdout: result.stdout,
            stderr: result.stderr,
            audit_jsonl_path: Some(audit_path),
        }
    }
}

/// Audit hook preamble plus `pip install` driven through `runpy`, targeting
/// the run-scoped site directory.
fn build_pip_bootstrap(job: &RunJob, audit_path: &Path, settings: &Settings) -> String {
    let site_dir = paths::site_packages_dir(&job.package_name, &job.version);
    let mut code = String::new();
    code.push_str("import runpy\n");
    code.push_str(&build_audit_hook_code(audit_path));
    code.push_str(&format!(
        "sys.argv=['pip','install',{},'--disable-pip-version-check','--no-input','--cache-dir',{},'--target',{}]\n",
        py_arg(&format!("{}=={}", job.package_name, job.version)),
        py_arg(&settings.pip_cache_dir),
        py_arg(&site_dir),
    ));
    code.push_str("runpy.run_module('pip',run_name='__main__')\n");
    code
}

fn py_arg(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Total size of regular files under `root`. Missing directories count as
/// zero; entries that vanish mid-walk are skipped.
fn dir_size(root: &Path) -> u64 {
    if !root.exists() {
        return 0;
    }
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = path.metadata() {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
    }
    total
}
