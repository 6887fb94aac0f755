use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::command::{ProcessTable, ToolSpec};
use crate::events::ProgressEvent;
use crate::probe::{self, CurlProber, HttpProber, ProbeSettings, Prober};
use crate::session::{Pipeline, PipelineSettings, ScanSession, SessionId, StageTimeouts};
use crate::{crawler, enumerate, utils, xss};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbeBackend {
    #[default]
    Http,
    Curl,
}

impl ProbeBackend {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" | "reqwest" => Ok(ProbeBackend::Http),
            "curl" => Ok(ProbeBackend::Curl),
            other => Err(format!("invalid probe backend '{other}', expected http or curl")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeBackend::Http => "http",
            ProbeBackend::Curl => "curl",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub domains: Vec<String>,
    pub input_file: Option<String>,
    pub output_dir: String,
    pub max_sessions: usize,
    pub enumerator: ToolSpec,
    pub crawler: ToolSpec,
    pub scanner: ToolSpec,
    pub curl: ToolSpec,
    pub probe_backend: ProbeBackend,
    pub probe_timeout_seconds: u64,
    pub probe_concurrency: usize,
    pub rate: u32,
    pub alive_statuses: HashSet<u16>,
    pub proxy: Option<String>,
    pub enumerate_timeout_seconds: u64,
    pub crawl_timeout_seconds: u64,
    pub scan_timeout_seconds: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            input_file: None,
            output_dir: "./output".to_string(),
            max_sessions: 2,
            enumerator: enumerate::default_tool(),
            crawler: crawler::default_tool(),
            scanner: xss::default_tool(),
            curl: probe::default_curl_tool(),
            probe_backend: ProbeBackend::Http,
            probe_timeout_seconds: 10,
            probe_concurrency: 10,
            rate: 0,
            alive_statuses: probe::default_alive_statuses(),
            proxy: None,
            enumerate_timeout_seconds: 600,
            crawl_timeout_seconds: 1800,
            scan_timeout_seconds: 1800,
        }
    }
}

impl Options {
    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            enumerator: self.enumerator.clone(),
            crawler: self.crawler.clone(),
            scanner: self.scanner.clone(),
            timeouts: StageTimeouts {
                enumerate: Duration::from_secs(self.enumerate_timeout_seconds),
                crawl: Duration::from_secs(self.crawl_timeout_seconds),
                scan: Duration::from_secs(self.scan_timeout_seconds),
            },
            probe: ProbeSettings {
                concurrency: self.probe_concurrency.max(1),
                rate: self.rate,
                alive_statuses: self.alive_statuses.clone(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no targets provided (domains and input_file are both empty)")]
    NoTargets,

    #[error("invalid domain: {value}: {reason}")]
    InvalidDomain { value: String, reason: String },

    #[error("invalid max_sessions {value}, expected positive integer")]
    InvalidMaxSessions { value: usize },

    #[error("alive status list is empty")]
    EmptyAliveStatuses,

    #[error("failed to open file for {kind}: {path}: {source}")]
    FileOpen {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read lines for {kind}: {path}: {source}")]
    FileRead {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare output directory: {source}")]
    OutputDir {
        #[source]
        source: ArtifactError,
    },

    #[error("failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to setup proxy: {proxy}: {source}")]
    ProxySetup {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("task join failed: {source}")]
    TaskJoin {
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub started_at: Instant,
    pub elapsed: Duration,
    pub sessions: Vec<ScanSession>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state.is_failed())
            .count()
    }
}

pub struct Runner {
    options: Options,
    pipeline: Pipeline,
    processes: ProcessTable,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl Runner {
    pub fn new(options: Options) -> Result<Self, RunnerError> {
        let processes = ProcessTable::new();
        let timeout = Duration::from_secs(options.probe_timeout_seconds.max(1));
        let prober: Arc<dyn Prober> = match options.probe_backend {
            ProbeBackend::Http => Arc::new(build_http_prober(options.proxy.as_deref(), timeout)?),
            ProbeBackend::Curl => Arc::new(CurlProber::new(
                options.curl.clone(),
                timeout,
                processes.clone(),
            )),
        };
        Self::build(options, prober, processes)
    }

    // lets callers plug in their own liveness backend
    pub fn with_prober(options: Options, prober: Arc<dyn Prober>) -> Result<Self, RunnerError> {
        Self::build(options, prober, ProcessTable::new())
    }

    fn build(
        mut options: Options,
        prober: Arc<dyn Prober>,
        processes: ProcessTable,
    ) -> Result<Self, RunnerError> {
        if options.max_sessions == 0 {
            return Err(RunnerError::InvalidMaxSessions {
                value: options.max_sessions,
            });
        }
        if options.alive_statuses.is_empty() {
            return Err(RunnerError::EmptyAliveStatuses);
        }
        let mut domains = Vec::with_capacity(options.domains.len());
        for raw in options.domains.iter() {
            let domain = utils::normalize_domain(raw).map_err(|reason| {
                RunnerError::InvalidDomain {
                    value: raw.clone(),
                    reason,
                }
            })?;
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        options.domains = domains;

        let store = ArtifactStore::new(crate::config::expand_tilde(&options.output_dir));
        let pipeline = Pipeline::new(
            options.pipeline_settings(),
            prober,
            store,
            processes.clone(),
        );
        Ok(Self {
            options,
            pipeline,
            processes,
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn store(&self) -> &ArtifactStore {
        self.pipeline.store()
    }

    pub async fn load_targets(&self) -> Result<Vec<String>, RunnerError> {
        let mut out = self.options.domains.clone();
        if let Some(path) = self
            .options
            .input_file
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            for domain in read_domains_file(path).await? {
                if !out.contains(&domain) {
                    out.push(domain);
                }
            }
        }
        if out.is_empty() {
            return Err(RunnerError::NoTargets);
        }
        Ok(out)
    }

    pub async fn run(
        &self,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<RunSummary, RunnerError> {
        let targets = self.load_targets().await?;
        let (domain_tx, domain_rx) = mpsc::channel::<String>(targets.len().max(1));
        for domain in targets {
            // capacity matches the target count, so this never waits
            if domain_tx.send(domain).await.is_err() {
                break;
            }
        }
        drop(domain_tx);
        self.serve(domain_rx, events).await
    }

    // starts a session for every domain received until the channel closes or
    // the runner is cancelled. at most max_sessions run at the same time.
    pub async fn serve(
        &self,
        mut domains: mpsc::Receiver<String>,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<RunSummary, RunnerError> {
        let started_at = Instant::now();
        self.store()
            .prepare()
            .await
            .map_err(|e| RunnerError::OutputDir { source: e })?;

        let limiter = Arc::new(Semaphore::new(self.options.max_sessions));
        let mut running: JoinSet<ScanSession> = JoinSet::new();
        let mut sessions = Vec::new();
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break,
                // finished sessions are collected as they end, so a long
                // stdin run does not keep a handle per domain ever seen
                Some(joined) = running.join_next() => {
                    sessions.push(joined.map_err(|e| RunnerError::TaskJoin { source: e })?);
                    continue;
                }
                next = domains.recv() => match next {
                    Some(raw) => raw,
                    None => break,
                },
            };
            let domain = match utils::normalize_domain(&raw) {
                Ok(domain) => domain,
                Err(reason) => {
                    warn!(value = %raw.trim(), "skipping target: {reason}");
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            debug!(session = %id, domain = %domain, "spawning session");
            let pipeline = self.pipeline.clone();
            let events = events.clone();
            let cancel = self.cancel.child_token();
            running.spawn(async move {
                let session = pipeline.run_session(id, domain, events, cancel).await;
                drop(permit);
                session
            });
        }

        while let Some(joined) = running.join_next().await {
            sessions.push(joined.map_err(|e| RunnerError::TaskJoin { source: e })?);
        }
        sessions.sort_by_key(|s| s.id);

        let elapsed = started_at.elapsed();
        info!(
            sessions = sessions.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "all sessions finished"
        );
        Ok(RunSummary {
            started_at,
            elapsed,
            sessions,
        })
    }

    // cancels every session and waits until no external tool is left running
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let active = self.processes.len();
        if active > 0 {
            info!(active, "waiting for external tools to exit");
        }
        self.processes.drained().await;
    }
}

fn build_http_prober(proxy: Option<&str>, timeout: Duration) -> Result<HttpProber, RunnerError> {
    if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
        reqwest::Proxy::all(proxy).map_err(|e| RunnerError::ProxySetup {
            proxy: proxy.to_string(),
            source: e,
        })?;
    }
    HttpProber::new(timeout, proxy).map_err(|e| RunnerError::HttpClientBuild { source: e })
}

async fn read_domains_file(path: &str) -> Result<Vec<String>, RunnerError> {
    let path = crate::config::expand_tilde_string(path);
    let handle = File::open(&path).await.map_err(|e| RunnerError::FileOpen {
        kind: "input_file",
        path: path.clone(),
        source: e,
    })?;
    let mut out: Vec<String> = Vec::new();
    let mut lines = BufReader::new(handle).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let domain =
                    utils::normalize_domain(line).map_err(|reason| RunnerError::InvalidDomain {
                        value: line.to_string(),
                        reason,
                    })?;
                if !out.contains(&domain) {
                    out.push(domain);
                }
            }
            Ok(None) => break,
            Err(e) => {
                return Err(RunnerError::FileRead {
                    kind: "input_file",
                    path,
                    source: e,
                })
            }
        }
    }
    Ok(out)
}
