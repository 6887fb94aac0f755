use std::path::PathBuf;
use std::time::Duration;

use itertools::Itertools;
use tracing::{info, warn};

use crate::artifacts::ArtifactKind;
use crate::command::{run_buffered, ToolSpec};
use crate::session::{Stage, StageContext, StageError};
use crate::utils;

pub fn default_tool() -> ToolSpec {
    ToolSpec::new("subfinder", &["-d", "{domain}", "-silent"])
}

#[derive(Clone, Debug)]
pub struct EnumerateOutcome {
    pub subdomains: Vec<String>,
    pub artifact: PathBuf,
}

// one host name per line. anything that is not a valid host name is skipped.
pub fn parse_subdomains<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let candidate = line.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
            if candidate.is_empty() {
                return None;
            }
            if !utils::is_valid_hostname(&candidate) {
                warn!(line = %line.as_ref(), "skipping malformed enumerator output");
                return None;
            }
            Some(candidate)
        })
        .unique()
        .collect()
}

pub async fn run(
    ctx: &StageContext,
    tool: &ToolSpec,
    timeout: Duration,
) -> Result<EnumerateOutcome, StageError> {
    let cmd = tool
        .command(&[("domain", ctx.domain.as_str())])
        .timeout(timeout);
    info!(domain = %ctx.domain, command = %cmd.display(), "running subdomain enumeration");
    ctx.events
        .status(Stage::Enumerate, format!("running {}", cmd.display()))
        .await;

    let output = run_buffered(&cmd, &ctx.processes, &ctx.cancel).await?;
    if !output.success() {
        return Err(StageError::NonZeroExit {
            program: cmd.program.clone(),
            code: output.exit_code,
            stderr: output.stderr,
        });
    }

    let subdomains = parse_subdomains(&output.stdout_lines);
    info!(domain = %ctx.domain, found = subdomains.len(), "enumeration complete");
    for subdomain in subdomains.iter() {
        ctx.events.discovery(Stage::Enumerate, subdomain.as_str()).await;
    }

    let artifact = ctx
        .store
        .write_lines(&ctx.domain, ArtifactKind::Subdomains, &subdomains)
        .await?;
    ctx.events
        .status(
            Stage::Enumerate,
            format!("{} subdomains found", subdomains.len()),
        )
        .await;
    ctx.events
        .artifact(
            Stage::Enumerate,
            ctx.store.reference(&ctx.domain, ArtifactKind::Subdomains),
        )
        .await;

    Ok(EnumerateOutcome {
        subdomains,
        artifact,
    })
}
