use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use futures::StreamExt;
use governor::{Quota, RateLimiter};
use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifacts::ArtifactKind;
use crate::command::{run_buffered, CommandError, ProcessTable, ToolSpec};
use crate::events::EventKind;
use crate::session::{Stage, StageContext, StageError};
use crate::urls::{normalize_origin, Origin};

pub const DEFAULT_ALIVE_STATUSES: [u16; 3] = [200, 301, 302];

pub fn default_alive_statuses() -> HashSet<u16> {
    DEFAULT_ALIVE_STATUSES.into_iter().collect()
}

pub fn default_curl_tool() -> ToolSpec {
    ToolSpec::new(
        "curl",
        &[
            "--max-time",
            "{timeout}",
            "-L",
            "-o",
            "/dev/null",
            "-s",
            "-w",
            "%{http_code} %{url_effective}",
            "{url}",
        ],
    )
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableReason {
    Timeout,
    Connect(String),
    MalformedOutput(String),
}

impl fmt::Display for UnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnreachableReason::Timeout => f.write_str("timed out"),
            UnreachableReason::Connect(msg) => write!(f, "connection failed: {msg}"),
            UnreachableReason::MalformedOutput(msg) => write!(f, "malformed probe output: {msg}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Responded { status: u16, final_url: String },
    Unreachable(UnreachableReason),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Liveness {
    Alive {
        status: u16,
        final_url: String,
        origin: Origin,
    },
    Dead {
        status: u16,
        final_url: String,
    },
    Unreachable {
        reason: UnreachableReason,
    },
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive { .. })
    }

    pub fn origin(&self) -> Option<&Origin> {
        match self {
            Liveness::Alive { origin, .. } => Some(origin),
            _ => None,
        }
    }
}

pub fn classify(outcome: ProbeOutcome, alive_statuses: &HashSet<u16>) -> Liveness {
    match outcome {
        ProbeOutcome::Responded { status, final_url } if alive_statuses.contains(&status) => {
            match normalize_origin(&final_url) {
                Ok(origin) => Liveness::Alive {
                    status,
                    final_url,
                    origin,
                },
                Err(e) => Liveness::Unreachable {
                    reason: UnreachableReason::MalformedOutput(e.to_string()),
                },
            }
        }
        ProbeOutcome::Responded { status, final_url } => Liveness::Dead { status, final_url },
        ProbeOutcome::Unreachable(reason) => Liveness::Unreachable { reason },
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe cancelled")]
    Cancelled,

    #[error("probe backend failed: {source}")]
    Backend {
        #[source]
        source: CommandError,
    },
}

impl From<ProbeError> for StageError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Cancelled => StageError::Cancelled,
            ProbeError::Backend { source } => StageError::from(source),
        }
    }
}

// a single request that follows redirects and reports the final status and
// url. per-url failures are outcomes, not errors; Err is reserved for
// cancellation and a backend that cannot run at all.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, cancel: &CancellationToken)
        -> Result<ProbeOutcome, ProbeError>;
}

#[derive(Clone, Debug)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:95.0) Gecko/20100101 Firefox/95.0",
            ),
        );

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .danger_accept_invalid_hostnames(true)
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            response = self.client.get(url).send() => response,
        };
        Ok(match response {
            Ok(response) => ProbeOutcome::Responded {
                status: response.status().as_u16(),
                final_url: response.url().to_string(),
            },
            Err(e) if e.is_timeout() => ProbeOutcome::Unreachable(UnreachableReason::Timeout),
            Err(e) => ProbeOutcome::Unreachable(UnreachableReason::Connect(e.to_string())),
        })
    }
}

// curl exit code for "operation timed out"
const CURL_TIMEOUT_EXIT: i32 = 28;

#[derive(Clone, Debug)]
pub struct CurlProber {
    tool: ToolSpec,
    timeout: Duration,
    processes: ProcessTable,
}

impl CurlProber {
    pub fn new(tool: ToolSpec, timeout: Duration, processes: ProcessTable) -> Self {
        Self {
            tool,
            timeout,
            processes,
        }
    }
}

#[async_trait]
impl Prober for CurlProber {
    async fn probe(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        let seconds = self.timeout.as_secs().max(1).to_string();
        // curl enforces --max-time itself; the extra grace only catches a hung process
        let cmd = self
            .tool
            .command(&[("url", url), ("timeout", seconds.as_str())])
            .timeout(self.timeout + Duration::from_secs(5));

        let output = match run_buffered(&cmd, &self.processes, cancel).await {
            Ok(output) => output,
            Err(CommandError::TimedOut { .. }) => {
                return Ok(ProbeOutcome::Unreachable(UnreachableReason::Timeout))
            }
            Err(e) if e.is_cancelled() => return Err(ProbeError::Cancelled),
            Err(e) => return Err(ProbeError::Backend { source: e }),
        };

        match output.exit_code {
            Some(0) => Ok(parse_curl_output(&output.stdout_lines.join("\n"), url)),
            Some(CURL_TIMEOUT_EXIT) => Ok(ProbeOutcome::Unreachable(UnreachableReason::Timeout)),
            code => {
                let detail = if output.stderr.is_empty() {
                    format!("curl {}", crate::command::describe_exit(&code))
                } else {
                    output.stderr
                };
                Ok(ProbeOutcome::Unreachable(UnreachableReason::Connect(detail)))
            }
        }
    }
}

// curl -w "%{http_code} %{url_effective}" output. status 000 means no http
// response was received.
pub fn parse_curl_output(stdout: &str, url: &str) -> ProbeOutcome {
    let line = stdout.trim();
    let (code, final_url) = match line.split_once(char::is_whitespace) {
        Some((code, rest)) => (code, rest.trim()),
        None => (line, ""),
    };
    let status: u16 = match code.parse() {
        Ok(status) => status,
        Err(_) => {
            return ProbeOutcome::Unreachable(UnreachableReason::MalformedOutput(format!(
                "unexpected curl output '{line}'"
            )))
        }
    };
    if status == 0 {
        return ProbeOutcome::Unreachable(UnreachableReason::Connect(
            "no HTTP response".to_string(),
        ));
    }
    let final_url = if final_url.is_empty() { url } else { final_url };
    ProbeOutcome::Responded {
        status,
        final_url: final_url.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSettings {
    pub concurrency: usize,
    pub rate: u32,
    pub alive_statuses: HashSet<u16>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate: 0,
            alive_statuses: default_alive_statuses(),
        }
    }
}

// every host over http first, then every host over https.
pub fn probe_urls(hosts: &[String]) -> Vec<String> {
    let http = hosts.iter().map(|h| format!("http://{h}"));
    let https = hosts.iter().map(|h| format!("https://{h}"));
    http.chain(https).collect()
}

// probes with bounded concurrency and an optional requests-per-second cap.
// results come back in the order of `urls`.
pub fn probe_stream<'a>(
    prober: &'a dyn Prober,
    urls: Vec<String>,
    settings: &'a ProbeSettings,
    cancel: &'a CancellationToken,
) -> impl Stream<Item = Result<(String, Liveness), ProbeError>> + 'a {
    let limiter = NonZeroU32::new(settings.rate)
        .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));

    stream::iter(urls)
        .map(move |url| {
            let limiter = limiter.clone();
            async move {
                if let Some(limiter) = limiter {
                    limiter.until_ready().await;
                }
                let outcome = prober.probe(&url, cancel).await?;
                let liveness = classify(outcome, &settings.alive_statuses);
                Ok((url, liveness))
            }
        })
        .buffered(settings.concurrency.max(1))
}

pub fn collect_alive<'a, I>(results: I) -> Vec<Origin>
where
    I: IntoIterator<Item = &'a Liveness>,
{
    results
        .into_iter()
        .filter_map(|l| l.origin().cloned())
        .unique()
        .collect()
}

#[derive(Clone, Debug)]
pub struct ValidateOutcome {
    pub alive: Vec<Origin>,
    pub artifact: PathBuf,
}

pub async fn validate(
    ctx: &StageContext,
    prober: &dyn Prober,
    settings: &ProbeSettings,
    hosts: &[String],
) -> Result<ValidateOutcome, StageError> {
    let urls = probe_urls(hosts);
    let total = urls.len();
    info!(domain = %ctx.domain, total, "probing candidate urls");
    ctx.events
        .status(
            Stage::Validate,
            format!("probing {} hosts over http and https ({total} urls)", hosts.len()),
        )
        .await;

    let mut results: Vec<Liveness> = Vec::with_capacity(total);
    let stream = probe_stream(prober, urls, settings, &ctx.cancel);
    futures::pin_mut!(stream);

    // probes keep running while a slow consumer drains the event channel,
    // otherwise in-flight requests would time out waiting on it.
    let mut pending: VecDeque<EventKind> = VecDeque::new();
    let mut exhausted = false;
    while !exhausted || !pending.is_empty() {
        tokio::select! {
            item = stream.next(), if !exhausted => match item {
                Some(item) => {
                    let (url, liveness) = item?;
                    debug!(%url, ?liveness, "probe finished");
                    pending.push_back(EventKind::Probe {
                        url,
                        liveness: liveness.clone(),
                    });
                    results.push(liveness);
                    pending.push_back(EventKind::Progress {
                        stage: Stage::Validate,
                        done: results.len(),
                        total,
                    });
                }
                None => exhausted = true,
            },
            permit = ctx.events.reserve(), if !pending.is_empty() => match permit {
                Some(permit) => {
                    if let Some(event) = pending.pop_front() {
                        ctx.events.send_reserved(permit, event);
                    }
                }
                None => pending.clear(),
            },
        }
    }

    let alive = collect_alive(results.iter());
    let lines: Vec<String> = alive.iter().map(ToString::to_string).collect();
    let artifact = ctx
        .store
        .write_lines(&ctx.domain, ArtifactKind::Alive, &lines)
        .await?;
    info!(domain = %ctx.domain, alive = alive.len(), "validation complete");
    ctx.events
        .status(Stage::Validate, format!("{} live origins", alive.len()))
        .await;
    ctx.events
        .artifact(
            Stage::Validate,
            ctx.store.reference(&ctx.domain, ArtifactKind::Alive),
        )
        .await;

    Ok(ValidateOutcome { alive, artifact })
}
