//! Static HTML report for one triage run: a header with the run identity
//! and status badge, then one card per highlight set. Long lists collapse
//! behind a "Show N more" toggle.

use crate::protocol::AuditHighlights;
use crate::protocol::RunJob;

/// Rows shown before a list collapses.
const LIST_PREVIEW_ROWS: usize = 16;

const STYLE: &str = "\
body{font-family:system-ui,sans-serif;margin:2rem auto;max-width:60rem;color:#222}\
header{margin-bottom:1.5rem}\
h1{font-size:1.4rem;margin:0 0 .5rem}\
.meta code{background:#f2f2f2;padding:.1rem .3rem;border-radius:3px}\
.badge{display:inline-block;padding:.2rem .6rem;border-radius:4px;font-weight:600}\
.badge--ok{background:#e6f7ee;color:#1d7a46}\
.badge--failed{background:#fdecea;color:#b3261e}\
.badge--timeout{background:#fef3e0;color:#9a6700}\
.card{border:1px solid #ddd;border-radius:6px;padding:1rem;margin:1rem 0}\
.card h2{font-size:1rem;margin:0 0 .6rem}\
.card .count{color:#777;font-weight:400}\
.rows{list-style:none;margin:0;padding:0;font-family:ui-monospace,monospace;font-size:.85rem}\
.row{padding:.15rem 0;border-bottom:1px solid #f0f0f0;word-break:break-all}\
.row--hidden{display:none}\
.rows-toggle{margin-top:.5rem;border:1px solid #ccc;background:#fafafa;border-radius:4px;padding:.25rem .7rem;cursor:pointer}\
footer{color:#999;font-size:.8rem;margin-top:2rem}";

const SCRIPT: &str = "\
function toggleRows(btn){\
var rows=btn.parentNode.querySelectorAll('.row--hidden');\
for(var i=0;i<rows.length;i++){rows[i].classList.remove('row--hidden');}\
btn.parentNode.removeChild(btn);}";

pub fn build_html_report(
    job: &RunJob,
    message: &str,
    ok: bool,
    timed_out: bool,
    highlights: &AuditHighlights,
) -> String {
    let (badge_class, badge_label) = if ok {
        ("badge--ok", "OK")
    } else if timed_out {
        ("badge--timeout", "FAILED (TIMED OUT)")
    } else {
        ("badge--failed", "FAILED")
    };

    let mut html = String::with_capacity(4096);
    html.push_str("<!doctype html>\n<html lang='en'>\n<head>\n<meta charset='utf-8'>\n");
    html.push_str(&format!(
        "<title>Triage report {}</title>\n",
        escape(&job.run_id)
    ));
    html.push_str(&format!("<style>{STYLE}</style>\n"));
    html.push_str(&format!("<script>{SCRIPT}</script>\n"));
    html.push_str("</head>\n<body>\n<header>\n<h1>Package triage report</h1>\n");
    html.push_str(&format!(
        "<p class='meta'>package <code>{}</code> version <code>{}</code> mode <code>{}</code> run <code>{}</code></p>\n",
        escape(&job.package_name),
        escape(&job.version),
        job.mode.as_str(),
        escape(&job.run_id),
    ));
    html.push_str(&format!(
        "<p><span class='badge {badge_class}'>{badge_label}</span></p>\n"
    ));
    html.push_str(&format!("<p>{}</p>\n</header>\n", escape(message)));

    push_card(&mut html, "Files Written", &highlights.files_written);
    push_card(&mut html, "Files Read", &highlights.files_read);
    push_card(
        &mut html,
        "Network Connections",
        &highlights.network_connections,
    );
    push_card(&mut html, "Subprocesses", &highlights.subprocesses);
    push_card(&mut html, "Top Events", &highlights.top_events);

    html.push_str(&format!(
        "<footer>generated {}</footer>\n</body>\n</html>\n",
        chrono::Utc::now().to_rfc3339()
    ));
    html
}

fn push_card(html: &mut String, title: &str, items: &[String]) {
    html.push_str("<section class='card'>\n");
    html.push_str(&format!(
        "<h2>{title} <span class='count'>({})</span></h2>\n",
        items.len()
    ));
    if items.is_empty() {
        html.push_str("<p class='meta'>none captured</p>\n</section>\n");
        return;
    }
    html.push_str("<ul class='rows' data-toggle='rows'>\n");
    for (idx, item) in items.iter().enumerate() {
        if idx < LIST_PREVIEW_ROWS {
            html.push_str(&format!("<li class='row'>{}</li>\n", escape(item)));
        } else {
            html.push_str(&format!(
                "<li class='row row--hidden'>{}</li>\n",
                escape(item)
            ));
        }
    }
    html.push_str("</ul>\n");
    if items.len() > LIST_PREVIEW_ROWS {
        html.push_str(&format!(
            "<button class='rows-toggle' onclick='toggleRows(this)'>Show {} more</button>\n",
            items.len() - LIST_PREVIEW_ROWS
        ));
    }
    html.push_str("</section>\n");
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
