//! Discord-style webhook dispatcher: one multipart POST per run with a
//! `payload_json` embed plus `files[i]` attachment parts. Best-effort from
//! the orchestrator's point of view.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::Result;
use crate::protocol::WebhookClient;
use crate::protocol::WebhookSummary;

const MAX_SUMMARY_CHARS: usize = 1000;
const MAX_FIELD_ITEMS: usize = 10;
const MAX_FIELD_VALUE_CHARS: usize = 1000;

const COLOR_OK: u32 = 0x2ECC71;
const COLOR_FAILED: u32 = 0xE74C3C;
const COLOR_TIMED_OUT: u32 = 0xF39C12;

pub struct DiscordWebhookClient {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl DiscordWebhookClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl WebhookClient for DiscordWebhookClient {
    async fn send(&self, summary: &WebhookSummary, attachment_paths: &[PathBuf]) -> Result<()> {
        let mut attached_names: Vec<String> = Vec::new();
        let mut parts: Vec<(String, reqwest::multipart::Part)> = Vec::new();

        for path in attachment_paths {
            if !path.is_file() {
                tracing::warn!(
                    "webhook attachment missing; sending summary without it run_id={} path={}",
                    summary.run_id,
                    path.display()
                );
                continue;
            }
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(
                        "webhook attachment unreadable run_id={} path={}: {err}",
                        summary.run_id,
                        path.display()
                    );
                    continue;
                }
            };
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name.clone())
                .mime_str(content_type_for(path))?;
            parts.push((format!("files[{}]", parts.len()), part));
            attached_names.push(file_name);
        }

        let payload = build_payload(summary, &attached_names);
        let mut form = reqwest::multipart::Form::new()
            .text("payload_json", serde_json::to_string(&payload)?);
        for (name, part) in parts {
            form = form.part(name, part);
        }

        tracing::info!(
            "posting webhook summary run_id={} attachments={}",
            summary.run_id,
            attached_names.len()
        );
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") => "application/gzip",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}

fn build_payload(summary: &WebhookSummary, attached_names: &[String]) -> serde_json::Value {
    let mut color = if summary.ok { COLOR_OK } else { COLOR_FAILED };
    if summary.timed_out {
        color = COLOR_TIMED_OUT;
    }

    let attachment_note = if attached_names.is_empty() {
        String::new()
    } else {
        let names = attached_names
            .iter()
            .map(|name| format!("`{name}`"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("\nAttachments: {names}")
    };

    let embed = json!({
        "title": "Package Triage Result",
        "description": format!("```text\n{}\n```{attachment_note}", normalize_summary(&summary.summary)),
        "color": color,
        "fields": [
            {"name": "Run ID", "value": format!("`{}`", summary.run_id), "inline": true},
            {"name": "Status", "value": format!("`{}`", status_label(summary)), "inline": true},
            {"name": "Mode", "value": format!("`{}`", summary.mode.as_str()), "inline": true},
            {"name": "Package", "value": format!("`{}`", summary.package_name), "inline": true},
            {"name": "Version", "value": format!("`{}`", summary.version), "inline": true},
            {"name": "Timed Out", "value": format!("`{}`", summary.timed_out), "inline": true},
            {
                "name": "Output",
                "value": format!("`stdout={}B`\n`stderr={}B`", summary.stdout_bytes, summary.stderr_bytes),
                "inline": true,
            },
            {"name": "Run Details", "value": render_run_details(summary), "inline": false},
            {
                "name": "Files Written",
                "value": render_list_field(&summary.files_written, "No write events captured."),
                "inline": false,
            },
            {
                "name": "Network Connections",
                "value": render_list_field(&summary.network_connections, "No connect events captured."),
                "inline": false,
            },
        ],
    });
    json!({ "embeds": [embed] })
}

fn normalize_summary(summary: &str) -> String {
    let mut normalized = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() > MAX_SUMMARY_CHARS {
        normalized = normalized
            .chars()
            .take(MAX_SUMMARY_CHARS - 3)
            .collect::<String>()
            + "...";
    }
    normalized.replace("```", "'''")
}

fn status_label(summary: &WebhookSummary) -> &'static str {
    if summary.ok {
        "OK"
    } else if summary.timed_out {
        "FAILED (TIMED OUT)"
    } else {
        "FAILED"
    }
}

fn render_run_details(summary: &WebhookSummary) -> String {
    let mut lines = Vec::new();
    if let Some(file_path) = &summary.file_path {
        lines.push(format!("`file_path={file_path}`"));
    }
    if let Some(entrypoint) = &summary.entrypoint {
        lines.push(format!("`entrypoint={entrypoint}`"));
    }
    if let Some(module_name) = &summary.module_name {
        lines.push(format!("`module_name={module_name}`"));
    }
    if lines.is_empty() {
        return "No optional run targets provided.".to_string();
    }
    lines.join("\n")
}

fn render_list_field(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    let mut shown: Vec<String> = items
        .iter()
        .take(MAX_FIELD_ITEMS)
        .map(|item| format!("• `{item}`"))
        .collect();
    if items.len() > MAX_FIELD_ITEMS {
        shown.push(format!("• `... +{} more`", items.len() - MAX_FIELD_ITEMS));
    }
    let rendered = shown.join("\n");
    if rendered.chars().count() <= MAX_FIELD_VALUE_CHARS {
        return rendered;
    }
    rendered
        .chars()
        .take(MAX_FIELD_VALUE_CHARS - 3)
        .collect::<String>()
        + "..."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RunMode;

    fn summary() -> WebhookSummary {
        WebhookSummary {
            run_id: "r1".to_string(),
            package_name: "sample".to_string(),
            version: "1.0".to_string(),
            mode: RunMode::Execute,
            ok: true,
            summary: "run ok; stdout=1B stderr=0B".to_string(),
            timed_out: false,
            stdout_bytes: 1,
            stderr_bytes: 0,
            file_path: None,
            entrypoint: None,
            module_name: None,
            files_written: Vec::new(),
            files_read: Vec::new(),
            network_connections: Vec::new(),
            subprocesses: Vec::new(),
            top_events: Vec::new(),
        }
    }

    #[test]
    fn payload_carries_identity_and_status_fields() {
        let payload = build_payload(&summary(), &[]);
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "Package Triage Result");
        assert_eq!(embed["color"], COLOR_OK);
        let fields = embed["fields"].as_array().unwrap();
        assert_eq!(fields[0]["value"], "`r1`");
        assert_eq!(fields[1]["value"], "`OK`");
        assert_eq!(fields[2]["value"], "`execute`");
        assert_eq!(fields[8]["value"], "No write events captured.");
    }

    #[test]
    fn timed_out_overrides_color_and_status() {
        let mut record = summary();
        record.ok = false;
        record.timed_out = true;
        let payload = build_payload(&record, &[]);
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], COLOR_TIMED_OUT);
        assert_eq!(embed["fields"][1]["value"], "`FAILED (TIMED OUT)`");
    }

    #[test]
    fn list_fields_are_capped_at_ten_items() {
        let mut record = summary();
        record.files_written = (0..15).map(|i| format!("sandbox: /tmp/f{i}")).collect();
        let payload = build_payload(&record, &[]);
        let value = payload["embeds"][0]["fields"][8]["value"].as_str().unwrap();
        assert_eq!(value.lines().count(), 11);
        assert!(value.ends_with("`... +5 more`"));
    }

    #[test]
    fn overlong_field_values_are_clipped() {
        let mut record = summary();
        record.network_connections = (0..10)
            .map(|i| format!("sandbox: connect {}.example.com:443", "x".repeat(150 + i)))
            .collect();
        let payload = build_payload(&record, &[]);
        let value = payload["embeds"][0]["fields"][9]["value"].as_str().unwrap();
        assert!(value.chars().count() <= MAX_FIELD_VALUE_CHARS);
        assert!(value.ends_with("..."));
    }

    #[test]
    fn summary_text_is_normalized_and_fenced() {
        let mut record = summary();
        record.summary = "a\n  b\t c ``` d".to_string();
        let payload = build_payload(&record, &[]);
        let description = payload["embeds"][0]["description"].as_str().unwrap();
        assert!(description.contains("a b c ''' d"));
    }

    #[test]
    fn attachment_note_lists_file_names() {
        let payload = build_payload(&summary(), &["audit.jsonl.gz".to_string()]);
        let description = payload["embeds"][0]["description"].as_str().unwrap();
        assert!(description.contains("Attachments: `audit.jsonl.gz`"));
    }

    #[test]
    fn run_details_render_provided_targets() {
        let mut record = summary();
        record.file_path = Some("/tmp/x.py".to_string());
        record.module_name = Some("sample".to_string());
        let payload = build_payload(&record, &[]);
        let value = payload["embeds"][0]["fields"][7]["value"].as_str().unwrap();
        assert!(value.contains("`file_path=/tmp/x.py`"));
        assert!(value.contains("`module_name=sample`"));
        assert!(!value.contains("entrypoint"));
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for(Path::new("a.jsonl.gz")), "application/gzip");
        assert_eq!(content_type_for(Path::new("report.html")), "text/html");
        assert_eq!(
            content_type_for(Path::new("audit.jsonl")),
            "application/octet-stream"
        );
    }
}
