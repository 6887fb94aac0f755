use colored::{ColoredString, Colorize};

use crate::events::{EventKind, ProgressEvent};
use crate::probe::Liveness;
use crate::session::{ScanSession, SessionState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

fn tag(label: ColoredString) -> String {
    format!("{}{}{}", "[".bold().white(), label, "]".bold().white())
}

fn prefix(event: &ProgressEvent) -> String {
    format!("{} {}", tag(event.domain.bold().cyan()), tag(event.session.to_string().normal()))
}

// one line per event. progress ticks are drawn by the progress bar, so they
// have no text form.
pub fn render_text(event: &ProgressEvent) -> Option<String> {
    let head = prefix(event);
    let line = match &event.event {
        EventKind::SessionStarted => format!("{head} {} session started", tag("INF".bold().blue())),
        EventKind::StageStarted { stage } => format!(
            "{head} {} stage {}",
            tag("INF".bold().blue()),
            stage.label().bold().white()
        ),
        EventKind::Status { stage, message } => {
            format!("{head} {} {stage}: {message}", tag("INF".bold().blue()))
        }
        EventKind::Discovery { stage, item } => {
            format!("{head} {} {}", tag(stage.label().bold().blue()), item)
        }
        EventKind::Probe { url, liveness } => match liveness {
            Liveness::Alive {
                status, final_url, ..
            } => format!(
                "{head} {} {} {} {}",
                tag("ALIVE".bold().green()),
                url,
                tag(status.to_string().bold().green()),
                final_url.dimmed()
            ),
            Liveness::Dead { status, final_url } => format!(
                "{head} {} {} {} {}",
                tag("DEAD".bold().red()),
                url,
                tag(status.to_string().bold().red()),
                final_url.dimmed()
            ),
            Liveness::Unreachable { reason } => format!(
                "{head} {} {} {}",
                tag("UNREACHABLE".bold().yellow()),
                url,
                reason.to_string().dimmed()
            ),
        },
        EventKind::Progress { .. } => return None,
        EventKind::Error { stage, error } => {
            format!("{head} {} {stage}: {}", tag("ERR".bold().red()), error.red())
        }
        EventKind::StageSkipped { stage, reason } => {
            format!("{head} {} {stage}: {reason}", tag("SKIP".bold().yellow()))
        }
        EventKind::ArtifactReady { stage, artifact } => format!(
            "{head} {} {stage}: {} saved to {}",
            tag("OK".bold().green()),
            artifact.kind.label(),
            artifact.token.bold().white()
        ),
        EventKind::SessionFinished { state } => {
            let label = match state {
                SessionState::Done => state.to_string().bold().green(),
                _ => state.to_string().bold().red(),
            };
            format!("{head} {} session {}", tag("FIN".bold().white()), label)
        }
    };
    Some(line)
}

pub fn render_json(event: &ProgressEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        format!(
            "{{\"session\":{},\"domain\":{:?},\"kind\":\"error\",\"error\":{:?}}}",
            event.session.0,
            event.domain,
            format!("failed to encode event: {e}")
        )
    })
}

pub fn render_summary(session: &ScanSession) -> String {
    let state = if session.state.is_failed() {
        session.state.to_string().bold().red()
    } else {
        session.state.to_string().bold().green()
    };
    let mut out = format!(
        ":: {:<10}: {} {} subdomains, {} alive origins",
        session.domain, state, session.subdomains.len(), session.alive.len()
    );
    out.push_str(&format!(
        "\n   {:<10}: {} crawled, {} unique, {} with parameters, {} xss findings",
        "urls", session.crawled, session.unique_urls, session.parameterized, session.findings
    ));
    if let Some(reason) = session.failure.as_deref() {
        out.push_str(&format!("\n   {:<10}: {}", "reason", reason));
    }
    for (kind, path) in session.artifacts() {
        out.push_str(&format!("\n   {:<10}: {}", kind.label(), path.display()));
    }
    out
}
