mod context;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use context::{StageContext, StageError};

use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::command::{ProcessTable, ToolSpec};
use crate::events::{EventKind, EventSink, ProgressEvent};
use crate::probe::{ProbeSettings, Prober};
use crate::urls::Origin;
use crate::{crawler, enumerate, probe, xss};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Enumerate,
    Validate,
    Crawl,
    ScanXss,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Enumerate, Stage::Validate, Stage::Crawl, Stage::ScanXss];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Enumerate => "enumerate",
            Stage::Validate => "validate",
            Stage::Crawl => "crawl",
            Stage::ScanXss => "xss",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Enumerating,
    Validating,
    Crawling,
    ScanningXss,
    Done,
    Failed(Stage),
}

impl SessionState {
    pub fn running(stage: Stage) -> Self {
        match stage {
            Stage::Enumerate => SessionState::Enumerating,
            Stage::Validate => SessionState::Validating,
            Stage::Crawl => SessionState::Crawling,
            Stage::ScanXss => SessionState::ScanningXss,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Enumerating => f.write_str("enumerating"),
            SessionState::Validating => f.write_str("validating"),
            SessionState::Crawling => f.write_str("crawling"),
            SessionState::ScanningXss => f.write_str("scanning-xss"),
            SessionState::Done => f.write_str("done"),
            SessionState::Failed(stage) => write!(f, "failed({stage})"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScanSession {
    pub id: SessionId,
    pub domain: String,
    pub state: SessionState,
    pub subdomains: Vec<String>,
    pub alive: Vec<Origin>,
    pub crawled: usize,
    pub unique_urls: usize,
    pub parameterized: usize,
    pub findings: usize,
    pub subdomains_artifact: Option<PathBuf>,
    pub alive_artifact: Option<PathBuf>,
    pub crawl_artifact: Option<PathBuf>,
    pub parameters_artifact: Option<PathBuf>,
    pub xss_artifact: Option<PathBuf>,
    pub failure: Option<String>,
}

impl ScanSession {
    pub fn new(id: SessionId, domain: &str) -> Self {
        Self {
            id,
            domain: domain.to_string(),
            state: SessionState::Idle,
            subdomains: Vec::new(),
            alive: Vec::new(),
            crawled: 0,
            unique_urls: 0,
            parameterized: 0,
            findings: 0,
            subdomains_artifact: None,
            alive_artifact: None,
            crawl_artifact: None,
            parameters_artifact: None,
            xss_artifact: None,
            failure: None,
        }
    }

    fn fail(&mut self, stage: Stage, reason: String) {
        self.state = SessionState::Failed(stage);
        self.failure = Some(reason);
    }

    pub fn artifacts(&self) -> Vec<(ArtifactKind, &PathBuf)> {
        [
            (ArtifactKind::Subdomains, self.subdomains_artifact.as_ref()),
            (ArtifactKind::Alive, self.alive_artifact.as_ref()),
            (ArtifactKind::Crawl, self.crawl_artifact.as_ref()),
            (ArtifactKind::Parameters, self.parameters_artifact.as_ref()),
            (ArtifactKind::Xss, self.xss_artifact.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, path)| path.map(|p| (kind, p)))
        .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTimeouts {
    pub enumerate: Duration,
    pub crawl: Duration,
    pub scan: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            enumerate: Duration::from_secs(600),
            crawl: Duration::from_secs(1800),
            scan: Duration::from_secs(1800),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub enumerator: ToolSpec,
    pub crawler: ToolSpec,
    pub scanner: ToolSpec,
    pub timeouts: StageTimeouts,
    pub probe: ProbeSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enumerator: enumerate::default_tool(),
            crawler: crawler::default_tool(),
            scanner: xss::default_tool(),
            timeouts: StageTimeouts::default(),
            probe: ProbeSettings::default(),
        }
    }
}

// runs the stages for one domain at a time, in order. no stage is retried;
// the first unrecoverable stage error ends the session as Failed(stage).
#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<PipelineSettings>,
    prober: Arc<dyn Prober>,
    store: ArtifactStore,
    processes: ProcessTable,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        prober: Arc<dyn Prober>,
        store: ArtifactStore,
        processes: ProcessTable,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            prober,
            store,
            processes,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn run_session(
        &self,
        id: SessionId,
        domain: String,
        events: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> ScanSession {
        let mut session = ScanSession::new(id, &domain);
        let sink = EventSink::new(events, id, &domain, cancel.clone());
        let ctx = StageContext {
            domain: domain.clone(),
            store: self.store.clone(),
            processes: self.processes.clone(),
            cancel: cancel.clone(),
            events: sink.clone(),
        };

        let _domain_guard = tokio::select! {
            guard = self.store.lock_domain(&domain) => Some(guard),
            _ = cancel.cancelled() => None,
        };

        info!(session = %id, domain = %domain, "session started");
        sink.emit(EventKind::SessionStarted).await;

        for stage in Stage::ALL {
            let result = match ctx.check_cancelled() {
                Err(e) => Err(e),
                Ok(()) => {
                    session.state = SessionState::running(stage);
                    sink.emit(EventKind::StageStarted { stage }).await;
                    self.run_stage(stage, &ctx, &mut session).await
                }
            };
            if let Err(e) = result {
                error!(session = %id, domain = %domain, stage = %stage, "stage failed: {e}");
                sink.error(stage, e.to_string()).await;
                session.fail(stage, e.to_string());
                break;
            }
        }

        if !session.state.is_failed() {
            session.state = SessionState::Done;
        }
        info!(session = %id, domain = %domain, state = %session.state, "session finished");
        sink.emit(EventKind::SessionFinished {
            state: session.state,
        })
        .await;
        session
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &StageContext,
        session: &mut ScanSession,
    ) -> Result<(), StageError> {
        match stage {
            Stage::Enumerate => {
                let outcome = enumerate::run(
                    ctx,
                    &self.settings.enumerator,
                    self.settings.timeouts.enumerate,
                )
                .await?;
                session.subdomains = outcome.subdomains;
                session.subdomains_artifact = Some(outcome.artifact);
            }
            Stage::Validate => {
                let outcome = probe::validate(
                    ctx,
                    self.prober.as_ref(),
                    &self.settings.probe,
                    &session.subdomains,
                )
                .await?;
                session.alive = outcome.alive;
                session.alive_artifact = Some(outcome.artifact);
            }
            Stage::Crawl => {
                let targets = session
                    .alive_artifact
                    .clone()
                    .unwrap_or_else(|| ctx.store.path(&ctx.domain, ArtifactKind::Alive));
                let outcome = crawler::run(
                    ctx,
                    &self.settings.crawler,
                    self.settings.timeouts.crawl,
                    &targets,
                    session.alive.len(),
                )
                .await?;
                session.crawled = outcome.discovered;
                session.unique_urls = outcome.kept;
                session.crawl_artifact = Some(outcome.artifact);
            }
            Stage::ScanXss => {
                let outcome =
                    xss::run(ctx, &self.settings.scanner, self.settings.timeouts.scan).await?;
                session.parameterized = outcome.candidates;
                session.findings = outcome.findings;
                session.parameters_artifact = Some(outcome.parameters_artifact);
                session.xss_artifact = outcome.results_artifact;
            }
        }
        Ok(())
    }
}
