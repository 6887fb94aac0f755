use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::artifacts::ArtifactKind;
use crate::command::{run_streaming, CommandError, ToolSpec};
use crate::session::{Stage, StageContext, StageError};
use crate::urls;

pub fn default_tool() -> ToolSpec {
    ToolSpec::new("katana", &["-list", "{targets}", "-silent"])
}

#[derive(Clone, Debug)]
pub struct CrawlOutcome {
    pub artifact: PathBuf,
    pub discovered: usize,
    pub kept: usize,
}

// the crawler runs exactly once: every line it prints is written to the crawl
// artifact and forwarded as a discovery at the same time. the artifact is
// then rewritten with one url per parameter shape.
pub async fn run(
    ctx: &StageContext,
    tool: &ToolSpec,
    timeout: Duration,
    targets: &Path,
    target_count: usize,
) -> Result<CrawlOutcome, StageError> {
    if target_count == 0 {
        let artifact = ctx
            .store
            .write_lines(&ctx.domain, ArtifactKind::Crawl, Vec::<String>::new())
            .await?;
        ctx.events
            .skipped(Stage::Crawl, "no live origins, crawler not started")
            .await;
        ctx.events
            .artifact(
                Stage::Crawl,
                ctx.store.reference(&ctx.domain, ArtifactKind::Crawl),
            )
            .await;
        return Ok(CrawlOutcome {
            artifact,
            discovered: 0,
            kept: 0,
        });
    }

    let targets = targets.display().to_string();
    let cmd = tool
        .command(&[("targets", targets.as_str()), ("domain", ctx.domain.as_str())])
        .timeout(timeout);
    info!(domain = %ctx.domain, command = %cmd.display(), "running crawler");
    ctx.events
        .status(
            Stage::Crawl,
            format!("crawling {target_count} origins with {}", cmd.program),
        )
        .await;

    let mut writer = ctx
        .store
        .create_writer(&ctx.domain, ArtifactKind::Crawl)
        .await?;
    let mut stream = run_streaming(&cmd, &ctx.processes, &ctx.cancel).await?;

    // a timeout keeps what was captured so far; the session moves on
    let mut interrupted: Option<CommandError> = None;
    loop {
        match stream.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                writer.write_line(&line).await?;
                ctx.events.discovery(Stage::Crawl, line).await;
            }
            Ok(None) => break,
            Err(e @ CommandError::TimedOut { .. }) => {
                interrupted = Some(e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let (artifact, discovered) = writer.finish().await?;

    match interrupted {
        Some(e) => {
            warn!(domain = %ctx.domain, "crawler interrupted: {e}");
            ctx.events
                .error(Stage::Crawl, format!("{e}, keeping partial output"))
                .await;
        }
        None => {
            let exit = stream.finish().await?;
            if !exit.success() {
                let error = StageError::NonZeroExit {
                    program: cmd.program.clone(),
                    code: exit.exit_code,
                    stderr: exit.stderr,
                };
                warn!(domain = %ctx.domain, "{error}");
                ctx.events.error(Stage::Crawl, error.to_string()).await;
            }
        }
    }

    ctx.events
        .status(
            Stage::Crawl,
            format!("crawler finished with {discovered} urls, removing duplicate parameter sets"),
        )
        .await;
    let raw = ctx
        .store
        .read_lines(&ctx.domain, ArtifactKind::Crawl)
        .await?
        .unwrap_or_default();
    let kept = urls::dedup_by_parameter_shape(&raw);
    ctx.store
        .write_lines(&ctx.domain, ArtifactKind::Crawl, &kept)
        .await?;
    info!(domain = %ctx.domain, discovered, kept = kept.len(), "crawl complete");
    ctx.events
        .status(
            Stage::Crawl,
            format!("{} urls kept after deduplication", kept.len()),
        )
        .await;
    ctx.events
        .artifact(
            Stage::Crawl,
            ctx.store.reference(&ctx.domain, ArtifactKind::Crawl),
        )
        .await;

    Ok(CrawlOutcome {
        artifact,
        discovered,
        kept: kept.len(),
    })
}
