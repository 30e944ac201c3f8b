use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex_lite::Regex;

pub const JAIL_WORK_DIR: &str = "/opt/pkg-triage/work";

static UNSAFE_COMPONENT_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

pub fn jail_site_root() -> String {
    format!("{JAIL_WORK_DIR}/site")
}

/// Run-scoped site directory the installer targets and the executor puts on
/// `PYTHONPATH`.
pub fn site_packages_dir(package_name: &str, version: &str) -> String {
    let safe_package = sanitize_path_component(package_name);
    let safe_version = sanitize_path_component(version);
    format!("{}/{safe_package}-{safe_version}", jail_site_root())
}

fn sanitize_path_component(value: &str) -> String {
    UNSAFE_COMPONENT_CHARS.replace_all(value, "_").into_owned()
}

/// `/tmp/audit-<run_id>.jsonl`, written by the sandbox executor.
pub fn sandbox_audit_path(run_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/audit-{run_id}.jsonl"))
}

/// `/tmp/audit-<run_id>-install.jsonl`, written by the installer.
pub fn install_audit_path(run_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/audit-{run_id}-install.jsonl"))
}

/// `/tmp/audit-<run_id>-merged.jsonl`, the stage-prefixed merge of both.
pub fn merged_audit_path(run_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/audit-{run_id}-merged.jsonl"))
}

/// `/tmp/audit-report-<run_id>.html`.
pub fn report_path(run_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/audit-report-{run_id}.html"))
}
