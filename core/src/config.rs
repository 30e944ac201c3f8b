use std::net::IpAddr;

use crate::error::Result;
use crate::error::TriageErr;

pub const DEFAULT_PACKAGE_DENYLIST: &str = "torch,tensorflow,jaxlib";
pub const DEFAULT_DNS_RESOLVERS: &str = "1.1.1.1,8.8.8.8";

/// Immutable service settings, resolved once at startup. Construction goes
/// through an injectable lookup so tests never mutate the process
/// environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_token: String,
    pub discord_webhook_url: String,
    pub max_concurrency: usize,
    pub queue_limit: usize,
    pub per_ip_rate_limit: u32,
    pub per_ip_rate_window_sec: u64,
    pub run_timeout_sec: u64,
    pub rlimit_cpu_sec: u64,
    pub rlimit_as_mb: u64,
    pub cgroup_pids_max: u64,
    pub enable_cgroup_pids_limit: bool,
    pub rlimit_nofile: u64,
    pub pip_cache_dir: String,
    pub max_download_bytes: u64,
    pub package_denylist: Vec<String>,
    pub dns_resolvers: Vec<String>,
    pub nsjail_config_path: String,
    pub jail_python_name: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_token = required(&lookup, "API_TOKEN")?;
        let discord_webhook_url = required(&lookup, "DISCORD_WEBHOOK_URL")?;
        let denylist = lookup("PACKAGE_DENYLIST")
            .unwrap_or_else(|| DEFAULT_PACKAGE_DENYLIST.to_string())
            .split(',')
            .map(|entry| entry.trim().to_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        let resolvers = parse_dns_resolvers(
            &lookup("DNS_RESOLVERS").unwrap_or_else(|| DEFAULT_DNS_RESOLVERS.to_string()),
        )?;

        Ok(Self {
            api_token,
            discord_webhook_url,
            max_concurrency: int_env(&lookup, "MAX_CONCURRENCY", 2, 1)? as usize,
            queue_limit: int_env(&lookup, "QUEUE_LIMIT", 20, 1)? as usize,
            per_ip_rate_limit: int_env(&lookup, "PER_IP_RATE_LIMIT", 30, 1)? as u32,
            per_ip_rate_window_sec: int_env(&lookup, "PER_IP_RATE_WINDOW_SEC", 60, 1)?,
            run_timeout_sec: int_env(&lookup, "RUN_TIMEOUT_SEC", 45, 1)?,
            rlimit_cpu_sec: int_env(&lookup, "RLIMIT_CPU_SEC", 30, 1)?,
            rlimit_as_mb: int_env(&lookup, "RLIMIT_AS_MB", 1024, 128)?,
            cgroup_pids_max: int_env(&lookup, "CGROUP_PIDS_MAX", 128, 8)?,
            enable_cgroup_pids_limit: bool_env(&lookup, "ENABLE_CGROUP_PIDS_LIMIT", true)?,
            rlimit_nofile: int_env(&lookup, "RLIMIT_NOFILE", 1024, 64)?,
            pip_cache_dir: lookup("PIP_CACHE_DIR").unwrap_or_else(|| "/var/cache/pip".to_string()),
            max_download_bytes: int_env(&lookup, "MAX_DOWNLOAD_BYTES", 300_000_000, 1)?,
            package_denylist: denylist,
            dns_resolvers: resolvers,
            nsjail_config_path: lookup("NSJAIL_CONFIG_PATH")
                .unwrap_or_else(|| "/etc/nsjail.cfg".to_string()),
            jail_python_name: lookup("JAIL_PYTHON_NAME")
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "python3".to_string()),
        })
    }
}

fn required<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(TriageErr::Config(format!(
            "Missing required environment variable: {name}"
        ))),
    }
}

fn int_env<F>(lookup: &F, name: &str, default: u64, minimum: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(name) {
        None => default,
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| TriageErr::Config(format!("{name} must be an integer, got {raw:?}")))?,
    };
    if value < minimum {
        return Err(TriageErr::Config(format!("{name} must be >= {minimum}")));
    }
    Ok(value)
}

fn bool_env<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(TriageErr::Config(format!(
                "{name} must be a boolean, got {raw:?}"
            ))),
        },
    }
}

fn parse_dns_resolvers(raw: &str) -> Result<Vec<String>> {
    let mut resolvers = Vec::new();
    for part in raw.split(',') {
        let value = part.trim();
        if value.is_empty() {
            continue;
        }
        let parsed: IpAddr = value.parse().map_err(|_| {
            TriageErr::Config(format!("DNS_RESOLVERS entry is not an IP address: {value:?}"))
        })?;
        if !matches!(parsed, IpAddr::V4(_)) {
            return Err(TriageErr::Config(
                "DNS_RESOLVERS currently supports IPv4 addresses only".to_string(),
            ));
        }
        resolvers.push(value.to_string());
    }
    if resolvers.is_empty() {
        return Err(TriageErr::Config(
            "DNS_RESOLVERS must contain at least one IP".to_string(),
        ));
    }
    Ok(resolvers)
}
