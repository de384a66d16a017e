//! Static HTML report of a chain's residual-size distribution.

use std::io::Write;
use std::path::Path;
use xmrtrace::{ReportData, RunReport};

/// Render a static HTML report to `out_path`. Embeds the full residual bundle for verification.
pub fn render_report(data: &ReportData, out_path: impl AsRef<Path>) -> Result<(), ReportError> {
    let html = build_html(data)?;
    let mut f = std::fs::File::create(out_path.as_ref()).map_err(ReportError::Io)?;
    f.write_all(html.as_bytes()).map_err(ReportError::Io)?;
    Ok(())
}

/// Build HTML string from report data (for testing or in-memory use).
pub fn build_html(data: &ReportData) -> Result<String, ReportError> {
    let json_embed = serde_json::to_string(&data.bundle).map_err(ReportError::Json)?;
    let json_escaped = escape_html(&json_embed);
    let chain_escaped = escape_html(data.bundle.chain.as_str());
    let hash_escaped = escape_html(&data.reproducibility_hash_sha256);
    let stats = &data.bundle.stats;

    let pct = stats
        .deanonymized_pct()
        .map(|x| format!("{:.2}%", x))
        .unwrap_or_else(|| "—".to_string());
    let histogram_rows = histogram_rows(&stats.bincount());
    let last_run = data
        .last_run
        .as_ref()
        .map(last_run_card)
        .unwrap_or_default();

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8"/>
<meta name="viewport" content="width=device-width,initial-scale=1"/>
<title>Ring intersection – {chain}</title>
<style>
:root {{ font-family: system-ui, sans-serif; background: #0f1419; color: #e6edf3; }}
body {{ max-width: 720px; margin: 0 auto; padding: 1.5rem; }}
h1 {{ font-size: 1.4rem; margin-bottom: 0.5rem; }}
h2 {{ font-size: 1.1rem; margin-top: 1.5rem; color: #8b949e; }}
.mono {{ font-family: ui-monospace, monospace; font-size: 0.9em; word-break: break-all; }}
.card {{ background: #161b22; border: 1px solid #30363d; border-radius: 6px; padding: 1rem; margin: 0.5rem 0; }}
.grid {{ display: grid; grid-template-columns: auto 1fr; gap: 0.25rem 1rem; }}
.label {{ color: #8b949e; }}
.hash {{ font-size: 0.85em; }}
.footer {{ margin-top: 2rem; font-size: 0.85rem; color: #8b949e; }}
table {{ width: 100%; border-collapse: collapse; }}
td {{ padding: 0.15rem 0.5rem; }}
.bar {{ background: #58a6ff; height: 0.8rem; }}
</style>
</head>
<body>
<h1>Ring Intersection Report</h1>
<p class="mono">{chain}</p>
<p>Generated: {created}</p>

<h2>Summary</h2>
<div class="card">
  <div class="grid">
    <span class="label">Narrowed key images</span><span class="mono">{total}</span>
    <span class="label">Intersection size 1</span><span class="mono">{one}</span>
    <span class="label">Intersection size 0</span><span class="mono">{zero}</span>
    <span class="label">Rest</span><span class="mono">{rest}</span>
    <span class="label">Not narrowed</span><span class="mono">{not_narrowed}</span>
    <span class="label">Deanonymized</span><span class="mono">{pct}</span>
  </div>
</div>

<h2>Residual size histogram</h2>
<div class="card">
  <table>
    <tr><td class="label">size</td><td class="label">images</td><td></td></tr>
{histogram_rows}  </table>
</div>
{last_run}
<h2>Reproducibility</h2>
<div class="card">
  <div class="mono hash">SHA-256: {hash}</div>
  <p class="footer">Verify by re-running <code>xmrtrace verify --bundle &lt;file&gt;</code> and comparing the hash.</p>
</div>

<h2>Residual bundle (embedded)</h2>
<div class="card">
  <p class="footer">The full residual bundle is embedded below for verification. Do not edit.</p>
  <script type="application/json" id="residual-bundle">{json_embed}</script>
</div>

<div class="footer">
  <p>Generated by <a href="https://github.com/gorusys/xmrtrace" style="color:#58a6ff">xmrtrace</a>. Read-only tool; no signatures verified.</p>
</div>
</body>
</html>"#,
        chain = chain_escaped,
        created = escape_html(&data.bundle.created_utc_rfc3339),
        total = stats.total,
        one = stats.fully_deanonymized,
        zero = stats.anomalies,
        rest = stats.ambiguous,
        not_narrowed = stats.not_narrowed,
        pct = pct,
        histogram_rows = histogram_rows,
        last_run = last_run,
        hash = hash_escaped,
        json_embed = json_escaped,
    );
    Ok(html)
}

/// One row per residual size, bar widths relative to the largest bucket.
fn histogram_rows(bins: &[u64]) -> String {
    let peak = bins.iter().copied().max().unwrap_or(0).max(1);
    bins.iter()
        .enumerate()
        .map(|(size, count)| {
            let width = count * 100 / peak;
            format!(
                "    <tr><td class=\"mono\">{size}</td><td class=\"mono\">{count}</td><td><div class=\"bar\" style=\"width:{width}%\"></div></td></tr>\n"
            )
        })
        .collect()
}

fn last_run_card(run: &RunReport) -> String {
    format!(
        r#"
<h2>Last run</h2>
<div class="card">
  <div class="grid">
    <span class="label">Shared key images</span><span class="mono">{}</span>
    <span class="label">Processed</span><span class="mono">{}</span>
    <span class="label">Fully deanonymized</span><span class="mono">{}</span>
    <span class="label">Anomalies</span><span class="mono">{}</span>
    <span class="label">Partial resolution warnings</span><span class="mono">{}</span>
    <span class="label">Malformed ledger data</span><span class="mono">{}</span>
    <span class="label">Failures</span><span class="mono">{}</span>
  </div>
</div>
"#,
        run.shared_images,
        run.processed,
        run.fully_deanonymized,
        run.anomalies,
        run.partial_warnings,
        run.malformed,
        run.failures.len(),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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

#[derive(Debug)]
pub enum ReportError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Io(e) => write!(f, "io: {}", e),
            ReportError::Json(e) => write!(f, "json: {}", e),
        }
    }
}

impl std::error::Error for ReportError {}
