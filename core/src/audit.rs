//! Audit stream ingestion: JSONL record parsing, semantic extraction of
//! file writes/reads, network endpoints and subprocess invocations, and the
//! event histogram.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::Deserialize;

use crate::literal::Value;
use crate::literal::parse_args;
use crate::protocol::AuditHighlights;

pub const HIGHLIGHT_CAP: usize = 200;
pub const TOP_EVENT_COUNT: usize = 25;

const SUBPROCESS_CMD_CAP: usize = 120;
const SUBPROCESS_ARGV_HEAD: usize = 8;

static HOST_PORT_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*'([^']+)'\s*,\s*(\d{1,5})\s*[,)]").unwrap());
static QUOTED_STRING: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']*)'").unwrap());
static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(https?|wss?)://[^\s'"\)\],]+"#).unwrap());
static FIRST_INT_AFTER_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*(-?\d+)").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct AuditRecord {
    pub event: String,
    #[serde(default)]
    pub args: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Install,
    Sandbox,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Install => "install",
            Stage::Sandbox => "sandbox",
        }
    }
}

/// Parses one audit line: either a bare JSON object or the merged form
/// prefixed `install:`/`sandbox:`. Lines that match neither are skipped by
/// callers. Prefix stripping is the exact inverse of merge prefixing.
pub fn parse_audit_record(line: &str) -> Option<AuditRecord> {
    let trimmed = line.trim();
    let body = trimmed
        .strip_prefix("install:")
        .or_else(|| trimmed.strip_prefix("sandbox:"))
        .unwrap_or(trimmed);
    let record: AuditRecord = serde_json::from_str(body.trim_start()).ok()?;
    if record.event.is_empty() {
        return None;
    }
    Some(record)
}

/// Insertion-ordered, deduplicating set with a hard capacity. Overflow
/// evicts the oldest entry; re-inserting an existing key changes nothing.
pub struct CappedSet {
    cap: usize,
    items: VecDeque<String>,
    seen: HashSet<String>,
}

impl CappedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn insert(&mut self, item: String) {
        if self.seen.contains(&item) {
            return;
        }
        if self.items.len() == self.cap {
            if let Some(oldest) = self.items.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(item.clone());
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items.into_iter().collect()
    }
}

/// Accumulates highlights over one or more audit sources.
pub struct AuditCollector {
    files_written: CappedSet,
    files_read: CappedSet,
    network_connections: CappedSet,
    subprocesses: CappedSet,
    event_counts: HashMap<String, u64>,
}

impl Default for AuditCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditCollector {
    pub fn new() -> Self {
        Self {
            files_written: CappedSet::new(HIGHLIGHT_CAP),
            files_read: CappedSet::new(HIGHLIGHT_CAP),
            network_connections: CappedSet::new(HIGHLIGHT_CAP),
            subprocesses: CappedSet::new(HIGHLIGHT_CAP),
            event_counts: HashMap::new(),
        }
    }

    pub fn ingest_file(&mut self, stage: Stage, path: &Path) -> io::Result<()> {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let Ok(line) = line else { continue };
            self.ingest_line(stage, &line);
        }
        Ok(())
    }

    pub fn ingest_line(&mut self, stage: Stage, line: &str) {
        let Some(record) = parse_audit_record(line) else {
            return;
        };
        self.ingest_record(stage, &record);
    }

    pub fn ingest_record(&mut self, stage: Stage, record: &AuditRecord) {
        *self.event_counts.entry(record.event.clone()).or_insert(0) += 1;

        let values = parse_args(&record.args);
        match record.event.as_str() {
            "open" => self.record_open(stage, record, values.as_deref()),
            "os.open" => self.record_os_open(stage, record, values.as_deref()),
            event if is_subprocess_event(event) => {
                self.record_subprocess(stage, record, values.as_deref())
            }
            event if is_dns_event(event) => self.record_dns(stage, record, values.as_deref()),
            event if is_network_event(event) => {
                self.record_network(stage, record, values.as_deref())
            }
            _ => {}
        }
    }

    pub fn finish(self) -> AuditHighlights {
        let mut counts: Vec<(String, u64)> = self.event_counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let top_events = counts
            .into_iter()
            .take(TOP_EVENT_COUNT)
            .map(|(event, count)| format!("{event}: {count}"))
            .collect();

        AuditHighlights {
            files_written: self.files_written.into_vec(),
            files_read: self.files_read.into_vec(),
            network_connections: self.network_connections.into_vec(),
            subprocesses: self.subprocesses.into_vec(),
            top_events,
        }
    }

    fn record_open(&mut self, stage: Stage, record: &AuditRecord, values: Option<&[Value]>) {
        let (path, mode) = match values {
            Some(values) => (
                values.first().and_then(|v| v.as_str().map(str::to_string)),
                values.get(1).and_then(|v| v.as_str().map(str::to_string)),
            ),
            None => {
                let mut strings = QUOTED_STRING
                    .captures_iter(&record.args)
                    .map(|c| c[1].to_string());
                (strings.next(), strings.next())
            }
        };
        let Some(path) = path else { return };
        let writes = mode
            .map(|mode| mode.chars().any(|c| matches!(c, 'w' | 'a' | 'x' | '+')))
            .unwrap_or(false);
        let entry = format!("{}: {path}", stage.label());
        if writes {
            self.files_written.insert(entry);
        } else {
            self.files_read.insert(entry);
        }
    }

    fn record_os_open(&mut self, stage: Stage, record: &AuditRecord, values: Option<&[Value]>) {
        let (path, flags) = match values {
            Some(values) => (
                values.first().and_then(|v| v.as_str().map(str::to_string)),
                values.iter().find_map(Value::as_int),
            ),
            None => (
                QUOTED_STRING
                    .captures_iter(&record.args)
                    .next()
                    .map(|c| c[1].to_string()),
                FIRST_INT_AFTER_COMMA
                    .captures(&record.args)
                    .and_then(|c| c[1].parse::<i64>().ok()),
            ),
        };
        let Some(path) = path else { return };
        let write_bits =
            (libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC) as i64;
        let writes = flags.map(|f| f & write_bits != 0).unwrap_or(false);
        let entry = format!("{}: {path}", stage.label());
        if writes {
            self.files_written.insert(entry);
        } else {
            self.files_read.insert(entry);
        }
    }

    fn record_dns(&mut self, stage: Stage, record: &AuditRecord, values: Option<&[Value]>) {
        let host = match values {
            Some(values) => values
                .iter()
                .find_map(|v| v.as_str())
                .filter(|s| is_hostlike(s))
                .map(str::to_string),
            None => QUOTED_STRING
                .captures_iter(&record.args)
                .map(|c| c[1].to_string())
                .find(|s| is_hostlike(s)),
        };
        if let Some(host) = host {
            self.network_connections
                .insert(format!("{}: dns {host}", stage.label()));
        }
    }

    fn record_network(&mut self, stage: Stage, record: &AuditRecord, values: Option<&[Value]>) {
        let endpoint = match values {
            Some(values) => find_endpoint(values),
            None => find_endpoint_in_text(&record.args),
        };
        if let Some(endpoint) = endpoint {
            let action = network_action(&record.event);
            self.network_connections
                .insert(format!("{}: {action} {endpoint}", stage.label()));
        }
    }

    fn record_subprocess(&mut self, stage: Stage, record: &AuditRecord, values: Option<&[Value]>) {
        let command = match values.and_then(|values| values.first().cloned()) {
            Some(Value::Str(s)) => Some(s),
            Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(&b).into_owned()),
            Some(Value::Other(text)) => Some(text),
            Some(Value::Tuple(items)) => Some(
                items
                    .iter()
                    .take(SUBPROCESS_ARGV_HEAD)
                    .map(stringify)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Some(Value::Int(n)) => Some(n.to_string()),
            None => {
                let argv: Vec<String> = QUOTED_STRING
                    .captures_iter(&record.args)
                    .take(SUBPROCESS_ARGV_HEAD)
                    .map(|c| c[1].to_string())
                    .collect();
                if argv.is_empty() {
                    Some(record.args.clone())
                } else {
                    Some(argv.join(" "))
                }
            }
        };
        let Some(command) = command else { return };
        let command = command.trim();
        if command.is_empty() {
            return;
        }
        self.subprocesses.insert(format!(
            "{}: {}",
            stage.label(),
            middle_truncate(command, SUBPROCESS_CMD_CAP)
        ));
    }
}

fn is_subprocess_event(event: &str) -> bool {
    matches!(
        event,
        "subprocess.Popen" | "subprocess.run" | "os.system" | "os.posix_spawn"
    ) || event.starts_with("os.exec")
        || event.starts_with("os.spawn")
}

fn is_dns_event(event: &str) -> bool {
    matches!(event, "socket.getaddrinfo" | "socket.getnameinfo")
}

fn is_network_event(event: &str) -> bool {
    event.starts_with("socket.")
        || event.starts_with("ssl.")
        || event.starts_with("http.client.")
        || ["connect", "sendto", "sendmsg", "bind", "listen", "urlopen"]
            .iter()
            .any(|needle| event.contains(needle))
}

fn network_action(event: &str) -> &'static str {
    if event.contains("connect") {
        "connect"
    } else if event.contains("sendto") {
        "sendto"
    } else if event.contains("bind") {
        "bind"
    } else if event.contains("listen") {
        "listen"
    } else if event.starts_with("ssl.") {
        "tls"
    } else {
        "network"
    }
}

/// A string that plausibly names a peer: non-empty, no whitespace, not a
/// path or repr fragment, not an address-family constant.
fn is_hostlike(s: &str) -> bool {
    !s.is_empty()
        && !s.chars().any(char::is_whitespace)
        && !s.starts_with('/')
        && !s.starts_with('<')
        && !s.starts_with('{')
        && s != "AF_INET"
        && s != "AF_INET6"
}

/// Depth-first scan for a `(hostlike, int)` pair or a URL string.
fn find_endpoint(values: &[Value]) -> Option<String> {
    if values.len() >= 2 {
        if let (Some(host), Some(port)) = (values[0].as_str(), values[1].as_int()) {
            if is_hostlike(host) {
                return Some(format!("{host}:{port}"));
            }
        }
    }
    for value in values {
        match value {
            Value::Str(s) => {
                if let Some(endpoint) = endpoint_from_url(s) {
                    return Some(endpoint);
                }
            }
            Value::Tuple(items) => {
                if let Some(endpoint) = find_endpoint(items) {
                    return Some(endpoint);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_endpoint_in_text(text: &str) -> Option<String> {
    if let Some(captures) = HOST_PORT_PAIR.captures(text) {
        let host = &captures[1];
        if is_hostlike(host) {
            return Some(format!("{host}:{}", &captures[2]));
        }
    }
    URL_IN_TEXT
        .find(text)
        .and_then(|m| endpoint_from_url(m.as_str()))
}

fn endpoint_from_url(candidate: &str) -> Option<String> {
    let (scheme, rest) = candidate.split_once("://")?;
    let default_port = match scheme {
        "http" | "ws" => 80,
        "https" | "wss" => 443,
        _ => return None,
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Some(format!("{host}:{port}"))
        }
        _ => Some(format!("{authority}:{default_port}")),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Int(n) => n.to_string(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Other(text) => text.clone(),
        Value::Tuple(items) => items.iter().map(stringify).collect::<Vec<_>>().join(" "),
    }
}

/// Keeps the head and tail of an over-long string around a `...` marker,
/// totalling exactly `cap` characters. The empty string stays empty and
/// anything within the cap is returned unchanged.
pub fn middle_truncate(s: &str, cap: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= cap {
        return s.to_string();
    }
    if cap <= 3 {
        return chars[..cap].iter().collect();
    }
    let keep = cap - 3;
    let head = keep - keep / 2;
    let tail = keep / 2;
    let mut out: String = chars[..head].iter().collect();
    out.push_str("...");
    out.extend(&chars[chars.len() - tail..]);
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(event: &str, args: &str) -> String {
        serde_json::json!({ "event": event, "args": args }).to_string()
    }

    #[test]
    fn open_write_modes_are_detected() {
        let mut collector = AuditCollector::new();
        collector.ingest_line(
            Stage::Install,
            &record("open", "('/tmp/install.log', 'w', 524865)"),
        );
        collector.ingest_line(Stage::Sandbox, &record("open", "('/etc/hosts', 'r', 524288)"));
        let highlights = collector.finish();

        assert_eq!(highlights.files_written, vec!["install: /tmp/install.log"]);
        assert_eq!(highlights.files_read, vec!["sandbox: /etc/hosts"]);
    }

    #[test]
    fn os_open_flag_bits_decide_write_vs_read() {
        let mut collector = AuditCollector::new();
        // 577 = O_WRONLY | O_CREAT | O_TRUNC
        collector.ingest_line(Stage::Sandbox, &record("os.open", "('/tmp/output.txt', 577, 420)"));
        collector.ingest_line(Stage::Sandbox, &record("os.open", "('/etc/passwd', 0, 420)"));
        let highlights = collector.finish();

        assert_eq!(highlights.files_written, vec!["sandbox: /tmp/output.txt"]);
        assert_eq!(highlights.files_read, vec!["sandbox: /etc/passwd"]);
    }

    #[test]
    fn network_endpoints_are_extracted_from_nested_tuples() {
        let mut collector = AuditCollector::new();
        collector.ingest_line(
            Stage::Install,
            &record("socket.connect", "(<socket.socket fd=3>, ('pypi.org', 443))"),
        );
        collector.ingest_line(Stage::Sandbox, &record("socket.sendto", "(b'x', ('1.1.1.1', 53))"));
        collector.ingest_line(
            Stage::Sandbox,
            &record("socket.bind", "(<socket.socket fd=4>, ('0.0.0.0', 8080))"),
        );
        let highlights = collector.finish();

        assert_eq!(
            highlights.network_connections,
            vec![
                "install: connect pypi.org:443",
                "sandbox: sendto 1.1.1.1:53",
                "sandbox: bind 0.0.0.0:8080",
            ]
        );
    }

    #[test]
    fn dns_lookups_produce_dns_lines() {
        let mut collector = AuditCollector::new();
        collector.ingest_line(
            Stage::Install,
            &record("socket.getaddrinfo", "('files.pythonhosted.org', 443, 0, 1, 6)"),
        );
        let highlights = collector.finish();
        assert_eq!(
            highlights.network_connections,
            vec!["install: dns files.pythonhosted.org"]
        );
    }

    #[test]
    fn urls_yield_default_ports() {
        let mut collector = AuditCollector::new();
        collector.ingest_line(
            Stage::Sandbox,
            &record("urllib.Request", "('https://example.com/path', None)"),
        );
        collector.ingest_line(
            Stage::Sandbox,
            &record("urllib.Request", "('http://example.org', None)"),
        );
        let highlights = collector.finish();
        // The event name contains no family marker, but "urlopen"-adjacent
        // urllib events do not match; only the URL-bearing network events
        // are captured.
        assert!(highlights.network_connections.is_empty());

        let mut collector = AuditCollector::new();
        collector.ingest_line(
            Stage::Sandbox,
            &record("urllib.urlopen", "('https://example.com/path',)"),
        );
        let highlights = collector.finish();
        assert_eq!(
            highlights.network_connections,
            vec!["sandbox: network example.com:443"]
        );
    }

    #[test]
    fn subprocess_argv_is_joined_and_truncated() {
        let mut collector = AuditCollector::new();
        collector.ingest_line(
            Stage::Sandbox,
            &record("subprocess.Popen", "(['python', '-c', 'print(1)'],)"),
        );
        let long_arg = "a".repeat(300);
        collector.ingest_line(
            Stage::Sandbox,
            &record("os.system", &format!("('{long_arg}',)")),
        );
        let highlights = collector.finish();

        assert_eq!(highlights.subprocesses[0], "sandbox: python -c print(1)");
        assert_eq!(highlights.subprocesses[1].len(), "sandbox: ".len() + 120);
        assert!(highlights.subprocesses[1].contains("..."));
    }

    #[test]
    fn regex_fallback_handles_unparseable_args() {
        let mut collector = AuditCollector::new();
        // A repr the literal parser rejects outright.
        collector.ingest_line(
            Stage::Install,
            &record("socket.connect", "(socket object at 0x7f, ('pypi.org', 443)"),
        );
        let highlights = collector.finish();
        assert_eq!(
            highlights.network_connections,
            vec!["install: connect pypi.org:443"]
        );
    }

    #[test]
    fn merged_prefix_parses_identically_to_bare_lines() {
        let line = record("open", "('/tmp/x', 'w', 0)");
        let bare = parse_audit_record(&line).unwrap();
        let install = parse_audit_record(&format!("install:{line}")).unwrap();
        let sandbox = parse_audit_record(&format!("sandbox:{line}")).unwrap();
        assert_eq!(bare.event, install.event);
        assert_eq!(bare.args, install.args);
        assert_eq!(bare.event, sandbox.event);
        assert_eq!(bare.args, sandbox.args);
    }

    #[test]
    fn non_json_lines_are_skipped() {
        let mut collector = AuditCollector::new();
        collector.ingest_line(Stage::Install, "not json");
        collector.ingest_line(Stage::Install, "");
        collector.ingest_line(Stage::Install, "install:still not json");
        assert!(collector.finish().is_empty());
    }

    #[test]
    fn highlight_sets_preserve_first_seen_order_and_dedupe() {
        let mut collector = AuditCollector::new();
        for path in ["/a", "/b", "/a", "/c", "/b"] {
            collector.ingest_line(Stage::Sandbox, &record("open", &format!("('{path}', 'w', 0)")));
        }
        let highlights = collector.finish();
        assert_eq!(
            highlights.files_written,
            vec!["sandbox: /a", "sandbox: /b", "sandbox: /c"]
        );
    }

    #[test]
    fn capped_set_evicts_oldest_on_overflow() {
        let mut set = CappedSet::new(3);
        for item in ["a", "b", "c", "d"] {
            set.insert(item.to_string());
        }
        assert_eq!(set.into_vec(), vec!["b", "c", "d"]);
    }

    #[test]
    fn capped_set_reinsert_does_not_reorder_or_shrink() {
        let mut set = CappedSet::new(3);
        set.insert("a".to_string());
        set.insert("b".to_string());
        set.insert("a".to_string());
        assert_eq!(set.len(), 2);
        assert_eq!(set.into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn histogram_ranks_by_count_then_name() {
        let mut collector = AuditCollector::new();
        for _ in 0..3 {
            collector.ingest_line(Stage::Sandbox, &record("import", "()"));
        }
        for _ in 0..3 {
            collector.ingest_line(Stage::Sandbox, &record("compile", "()"));
        }
        collector.ingest_line(Stage::Sandbox, &record("exec", "()"));
        let highlights = collector.finish();
        assert_eq!(
            highlights.top_events,
            vec!["compile: 3", "import: 3", "exec: 1"]
        );
    }

    #[test]
    fn middle_truncate_boundaries() {
        assert_eq!(middle_truncate("", 10), "");
        assert_eq!(middle_truncate("short", 10), "short");
        assert_eq!(middle_truncate("exactlyten", 10), "exactlyten");
        let truncated = middle_truncate(&"x".repeat(50), 10);
        assert_eq!(truncated.chars().count(), 10);
        assert!(truncated.contains("..."));
    }
}
