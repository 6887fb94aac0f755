use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::artifacts::ArtifactKind;
use crate::command::{run_streaming, CommandError, StdinSource, ToolSpec};
use crate::session::{Stage, StageContext, StageError};
use crate::urls;

pub fn default_tool() -> ToolSpec {
    ToolSpec::new("dalfox", &["pipe"])
}

#[derive(Clone, Debug)]
pub struct XssOutcome {
    pub parameters_artifact: PathBuf,
    pub results_artifact: Option<PathBuf>,
    pub candidates: usize,
    pub findings: usize,
}

pub async fn run(
    ctx: &StageContext,
    tool: &ToolSpec,
    timeout: Duration,
) -> Result<XssOutcome, StageError> {
    let crawled = ctx
        .store
        .read_lines(&ctx.domain, ArtifactKind::Crawl)
        .await?
        .unwrap_or_default();
    let candidates = urls::filter_parameterized(&crawled);
    let parameters_artifact = ctx
        .store
        .write_lines(&ctx.domain, ArtifactKind::Parameters, &candidates)
        .await?;
    info!(domain = %ctx.domain, candidates = candidates.len(), "filtered parameterized urls");

    if candidates.is_empty() {
        ctx.events
            .skipped(Stage::ScanXss, "no urls with query parameters, scanner not started")
            .await;
        return Ok(XssOutcome {
            parameters_artifact,
            results_artifact: None,
            candidates: 0,
            findings: 0,
        });
    }

    let cmd = tool
        .command(&[("domain", ctx.domain.as_str())])
        .stdin(StdinSource::File(parameters_artifact.clone()))
        .timeout(timeout);
    info!(domain = %ctx.domain, command = %cmd.display(), "running xss scanner");
    ctx.events
        .status(
            Stage::ScanXss,
            format!(
                "scanning {} parameterized urls with {}",
                candidates.len(),
                cmd.program
            ),
        )
        .await;

    let mut writer = ctx
        .store
        .create_writer(&ctx.domain, ArtifactKind::Xss)
        .await?;
    let mut stream = run_streaming(&cmd, &ctx.processes, &ctx.cancel).await?;

    let mut interrupted: Option<CommandError> = None;
    loop {
        match stream.next_line().await {
            Ok(Some(line)) => {
                writer.write_line(&line).await?;
                ctx.events.discovery(Stage::ScanXss, line).await;
            }
            Ok(None) => break,
            Err(e @ CommandError::TimedOut { .. }) => {
                interrupted = Some(e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let (results_artifact, findings) = writer.finish().await?;

    match interrupted {
        Some(e) => {
            warn!(domain = %ctx.domain, "xss scanner interrupted: {e}");
            ctx.events
                .error(Stage::ScanXss, format!("{e}, keeping partial results"))
                .await;
        }
        None => {
            let exit = stream.finish().await?;
            if exit.success() {
                ctx.events
                    .status(
                        Stage::ScanXss,
                        format!("xss scan completed with {findings} result lines"),
                    )
                    .await;
            } else {
                let error = StageError::NonZeroExit {
                    program: cmd.program.clone(),
                    code: exit.exit_code,
                    stderr: exit.stderr,
                };
                warn!(domain = %ctx.domain, "{error}");
                ctx.events.error(Stage::ScanXss, error.to_string()).await;
            }
        }
    }

    ctx.events
        .artifact(
            Stage::ScanXss,
            ctx.store.reference(&ctx.domain, ArtifactKind::Xss),
        )
        .await;

    Ok(XssOutcome {
        parameters_artifact,
        results_artifact: Some(results_artifact),
        candidates: candidates.len(),
        findings,
    })
}
