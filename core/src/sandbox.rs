//! Nsjail-backed sandbox executor plus the command plumbing it shares with
//! the installer: the nsjail argv prefix, the minimal child environment and
//! the generated Python audit bootstrap.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::exec::ProcessRunner;
use crate::paths;
use crate::protocol::RunJob;
use crate::protocol::SandboxExecutor;
use crate::protocol::SandboxOutcome;

/// Byte budget for one audit JSONL file, enforced inside the hook.
pub const MAX_AUDIT_BYTES: u64 = 5_000_000;

const RUNTIME_BINDMOUNTS_RO: &[&str] = &[
    "/usr",
    "/usr/local",
    "/bin",
    "/lib",
    "/lib64",
    "/etc/ssl/certs",
    "/etc/resolv.conf",
    "/etc/hosts",
];
const RUNTIME_BINDMOUNTS_RW: &[&str] = &["/tmp", paths::JAIL_WORK_DIR];

pub struct NsjailSandboxExecutor {
    runner: Arc<dyn ProcessRunner>,
    settings: Settings,
}

impl NsjailSandboxExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: Settings) -> Self {
        Self { runner, settings }
    }
}

#[async_trait]
impl SandboxExecutor for NsjailSandboxExecutor {
    async fn run(&self, job: &RunJob) -> SandboxOutcome {
        let audit_path = paths::sandbox_audit_path(&job.run_id);
        let site_dir = paths::site_packages_dir(&job.package_name, &job.version);

        let mut command = build_nsjail_prefix(&self.settings);
        command.push("--env".to_string());
        command.push(format!("PYTHONPATH={site_dir}"));
        command.push("--".to_string());
        command.push(jailed_python(&self.settings));
        command.push("-c".to_string());
        command.push(build_audit_code(job, &audit_path));

        let env = minimal_process_env(&[("PYTHONPATH", site_dir.as_str())]);
        let timeout = Duration::from_secs(self.settings.run_timeout_sec);

        match self.runner.run(&command, timeout, &env).await {
            Ok(result) => SandboxOutcome {
                ok: !result.timed_out && result.returncode == 0,
                stdout: result.stdout,
                stderr: result.stderr,
                timed_out: result.timed_out,
                audit_jsonl_path: Some(audit_path),
            },
            Err(err) => SandboxOutcome {
                ok: false,
                stdout: String::new(),
                stderr: format!("failed to spawn sandbox: {err}"),
                timed_out: false,
                audit_jsonl_path: Some(audit_path),
            },
        }
    }
}

/// Argv prefix every jailed child shares. Bindmounts are filtered to paths
/// that exist on the host.
pub fn build_nsjail_prefix(settings: &Settings) -> Vec<String> {
    let mut command = vec![
        "nsjail".to_string(),
        "--config".to_string(),
        settings.nsjail_config_path.clone(),
        "--time_limit".to_string(),
        settings.run_timeout_sec.to_string(),
        "--user".to_string(),
        "65534".to_string(),
        "--group".to_string(),
        "65534".to_string(),
        "--disable_clone_newuser".to_string(),
        "--rlimit_cpu".to_string(),
        settings.rlimit_cpu_sec.to_string(),
        "--rlimit_as".to_string(),
        settings.rlimit_as_mb.to_string(),
        "--rlimit_nofile".to_string(),
        settings.rlimit_nofile.to_string(),
    ];
    if settings.enable_cgroup_pids_limit {
        command.push("--cgroup_pids_max".to_string());
        command.push(settings.cgroup_pids_max.to_string());
    }
    for source in existing_paths(RUNTIME_BINDMOUNTS_RO) {
        command.push("--bindmount_ro".to_string());
        command.push(format!("{source}:{source}"));
    }
    for source in existing_paths(RUNTIME_BINDMOUNTS_RW) {
        command.push("--bindmount".to_string());
        command.push(format!("{source}:{source}"));
    }
    command.push("--bindmount_ro".to_string());
    command.push(format!(
        "{0}:{0}",
        settings.pip_cache_dir
    ));
    command.push("--env".to_string());
    command.push("LD_LIBRARY_PATH=".to_string());
    command
}

fn existing_paths(entries: &[&str]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| Path::new(entry).exists())
        .map(|entry| entry.to_string())
        .collect()
}

pub fn jailed_python(settings: &Settings) -> String {
    format!("/usr/local/bin/{}", settings.jail_python_name)
}

/// The explicit environment handed to every jailed child.
pub fn minimal_process_env(extra: &[(&str, &str)]) -> HashMap<String, String> {
    let mut env = HashMap::from([
        (
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| {
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
            }),
        ),
        ("HOME".to_string(), "/tmp".to_string()),
        ("TMPDIR".to_string(), "/tmp".to_string()),
    ]);
    for (key, value) in extra {
        env.insert(key.to_string(), value.to_string());
    }
    env
}

/// Python repr of an optional string, safe to splice into generated code.
fn py_repr(value: Option<&str>) -> String {
    match value {
        None => "None".to_string(),
        Some(text) => {
            let escaped = text.replace('\\', "\\\\").replace('\'', "\\'");
            format!("'{escaped}'")
        }
    }
}

/// The audit hook preamble shared by the sandbox and installer bootstraps:
/// one JSON object per audited event, byte-budgeted, flushed to `path`.
pub fn build_audit_hook_code(audit_path: &Path) -> String {
    let mut code = String::new();
    code.push_str("import json\n");
    code.push_str("import sys\n");
    code.push_str("import time\n");
    code.push_str(&format!("limit={MAX_AUDIT_BYTES}\n"));
    code.push_str("written=0\n");
    code.push_str(&format!(
        "f=open({},'w',encoding='utf-8')\n",
        py_repr(Some(&audit_path.to_string_lossy()))
    ));
    code.push_str("def _hook(event,args):\n");
    code.push_str("    global written\n");
    code.push_str("    if written >= limit:\n");
    code.push_str("        return\n");
    code.push_str("    try:\n");
    code.push_str("        frame=sys._getframe(1)\n");
    code.push_str("        caller={'file':frame.f_code.co_filename,'line':frame.f_lineno}\n");
    code.push_str("    except Exception:\n");
    code.push_str("        caller={}\n");
    code.push_str("    payload={'timestamp':time.strftime('%Y-%m-%dT%H:%M:%S+00:00',time.gmtime()),'event':event,'args':str(args),'caller':caller}\n");
    code.push_str("    line=json.dumps(payload)+'\\n'\n");
    code.push_str("    chunk=line[:limit-written]\n");
    code.push_str("    f.write(chunk)\n");
    code.push_str("    written += len(chunk)\n");
    code.push_str("sys.addaudithook(_hook)\n");
    code
}

/// Full sandbox bootstrap: audit hook plus the mode dispatch.
fn build_audit_code(job: &RunJob, audit_path: &Path) -> String {
    let mut code = String::new();
    code.push_str("import importlib\n");
    code.push_str("import importlib.metadata\n");
    code.push_str("import importlib.util\n");
    code.push_str("import runpy\n");
    code.push_str(&build_audit_hook_code(audit_path));
    code.push_str(&format!("mode={}\n", py_repr(Some(job.mode.as_str()))));
    code.push_str(&format!(
        "package_name={}\n",
        py_repr(Some(&job.package_name))
    ));
    code.push_str(&format!("file_path={}\n", py_repr(job.file_path.as_deref())));
    code.push_str(&format!(
        "entrypoint={}\n",
        py_repr(job.entrypoint.as_deref())
    ));
    code.push_str(&format!(
        "module_name={}\n",
        py_repr(job.module_name.as_deref())
    ));
    code.push_str("\n");
    code.push_str("def _normalize_name(value):\n");
    code.push_str("    return value.replace('-', '_').lower()\n");
    code.push_str("\n");
    code.push_str("def _resolve_attr(value, attr_path):\n");
    code.push_str("    current=value\n");
    code.push_str("    for name in attr_path.split('.'):\n");
    code.push_str("        current=getattr(current,name)\n");
    code.push_str("    return current\n");
    code.push_str("\n");
    code.push_str("def _call_entrypoint(spec):\n");
    code.push_str("    if ':' in spec:\n");
    code.push_str("        module_name,attr_path=spec.split(':',1)\n");
    code.push_str("        fn=_resolve_attr(importlib.import_module(module_name),attr_path)\n");
    code.push_str("        result=fn()\n");
    code.push_str("        if isinstance(result,int):\n");
    code.push_str("            raise SystemExit(result)\n");
    code.push_str("        return\n");
    code.push_str("    for candidate in importlib.metadata.entry_points(group='console_scripts'):\n");
    code.push_str("        if candidate.name == spec:\n");
    code.push_str("            _call_entrypoint(candidate.value)\n");
    code.push_str("            return\n");
    code.push_str("    raise RuntimeError(f'console entrypoint not found: {spec}')\n");
    code.push_str("\n");
    code.push_str("def _auto_console_entrypoint(package):\n");
    code.push_str("    package_norm=_normalize_name(package)\n");
    code.push_str("    candidates=[]\n");
    code.push_str("    for item in importlib.metadata.entry_points(group='console_scripts'):\n");
    code.push_str("        if _normalize_name(item.name) == package_norm:\n");
    code.push_str("            return item.value\n");
    code.push_str("        if _normalize_name(item.name).startswith(package_norm):\n");
    code.push_str("            candidates.append(item.value)\n");
    code.push_str("    if candidates:\n");
    code.push_str("        return candidates[0]\n");
    code.push_str("    return None\n");
    code.push_str("\n");
    code.push_str("def _run_module_default(package, requested_module):\n");
    code.push_str("    if requested_module:\n");
    code.push_str("        runpy.run_module(requested_module,run_name='__main__',alter_sys=True)\n");
    code.push_str("        return\n");
    code.push_str("    base=package.replace('-','_')\n");
    code.push_str("    runpy.run_module(base,run_name='__main__',alter_sys=True)\n");
    code.push_str("\n");
    code.push_str("if mode == 'execute':\n");
    code.push_str("    if file_path:\n");
    code.push_str("        runpy.run_path(file_path,run_name='__main__')\n");
    code.push_str("    elif entrypoint:\n");
    code.push_str("        _call_entrypoint(entrypoint)\n");
    code.push_str("    else:\n");
    code.push_str("        auto_spec=_auto_console_entrypoint(package_name)\n");
    code.push_str("        if auto_spec is None:\n");
    code.push_str("            raise RuntimeError('no console script entrypoint found for package')\n");
    code.push_str("        _call_entrypoint(auto_spec)\n");
    code.push_str("elif mode == 'execute_module':\n");
    code.push_str("    if file_path:\n");
    code.push_str("        runpy.run_path(file_path,run_name='__main__')\n");
    code.push_str("    elif entrypoint:\n");
    code.push_str("        _call_entrypoint(entrypoint)\n");
    code.push_str("    else:\n");
    code.push_str("        _run_module_default(package_name,module_name)\n");
    code.push_str("else:\n");
    code.push_str("    __import__(package_name)\n");
    code
}
