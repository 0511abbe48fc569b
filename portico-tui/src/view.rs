//! Rendering: a pure function of model state and a statistics snapshot.

use crate::model::{Model, RequestEntry};
use portico_core::stats::Snapshot;
use std::time::Duration;

const STAT_COL: usize = 8;

/// Render the whole dashboard frame.
pub fn render(model: &Model, snapshot: &Snapshot) -> String {
    let mut out = String::with_capacity(1024);

    out.push_str(&render_header(model));
    out.push_str("\n\n");
    out.push_str(&render_status(model));
    out.push('\n');

    if !model.tunnels.is_empty() {
        out.push('\n');
        out.push_str(&render_forwarding(model));
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&render_stats(snapshot));
    out.push('\n');

    if !model.requests.is_empty() {
        out.push('\n');
        out.push_str(&render_requests(model));
        out.push('\n');
    }

    if let Some(err) = &model.last_error {
        out.push('\n');
        out.push_str(&format!("{:<18}{err}\n", "Last Error"));
    }

    out
}

fn render_header(model: &Model) -> String {
    let title = "portico";
    let hint = "(q to quit)";
    let width = model.width.max(20) as usize;
    let padding = width.saturating_sub(title.len() + hint.len());
    format!("{title}{}{hint}", " ".repeat(padding))
}

fn render_status(model: &Model) -> String {
    let latency = if model.server_latency > Duration::ZERO {
        format!("{}ms", model.server_latency.as_millis())
    } else {
        "-".to_string()
    };
    [
        format!("{:<18}{}", "Session Status", model.status.as_str()),
        format!("{:<18}{}", "Version", env!("CARGO_PKG_VERSION")),
        format!("{:<18}{}", "Latency", latency),
        format!(
            "{:<18}http://127.0.0.1:{}",
            "Web Interface", model.inspector_port
        ),
    ]
    .join("\n")
}

fn render_forwarding(model: &Model) -> String {
    let mut lines = Vec::new();
    for (tunnel_idx, tunnel) in model.tunnels.iter().enumerate() {
        for (domain_idx, domain) in tunnel.bound_domains.iter().enumerate() {
            let label = if tunnel_idx == 0 && domain_idx == 0 {
                "Forwarding"
            } else {
                ""
            };
            lines.push(format!(
                "{:<18}{}://{} -> http://localhost:{}",
                label, tunnel.scheme, domain, tunnel.local_port
            ));
        }
    }
    lines.join("\n")
}

fn render_stats(snapshot: &Snapshot) -> String {
    let header = format!(
        "{:<18}{:<w$}{:<w$}{:<w$}{:<w$}{:<w$}{:<w$}",
        "Connections",
        "ttl",
        "opn",
        "rt1",
        "rt5",
        "p50",
        "p90",
        w = STAT_COL
    );
    let values = format!(
        "{:<18}{:<w$}{:<w$}{:<w$}{:<w$}{:<w$}{:<w$}",
        "",
        snapshot.total_connections,
        snapshot.open_connections,
        format_duration(snapshot.rt1),
        format_duration(snapshot.rt5),
        format_duration(snapshot.p50),
        format_duration(snapshot.p90),
        w = STAT_COL
    );
    format!("{header}\n{values}")
}

fn render_requests(model: &Model) -> String {
    let mut lines = vec![format!("{:<18}", "HTTP Requests")];
    for request in &model.requests {
        lines.push(render_request_line(request));
    }
    lines.join("\n")
}

fn render_request_line(request: &RequestEntry) -> String {
    format!(
        "{:<8}{:<42}{:<5}{}",
        request.method,
        truncate_path(&request.path, 40),
        request.status,
        format_duration(request.duration)
    )
}

fn format_duration(d: Duration) -> String {
    if d == Duration::ZERO {
        return "0.00".to_string();
    }
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        format!("{secs:.2}")
    } else {
        format!("{secs:.1}")
    }
}

fn truncate_path(path: &str, max_len: usize) -> String {
    if path.len() <= max_len {
        path.to_string()
    } else {
        format!("{}...", &path[..max_len - 3])
    }
}
