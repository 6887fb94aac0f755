use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactError, ArtifactKind, ArtifactStore};
use crate::command::{
    expand_placeholders, run_buffered, run_streaming, CommandError, ProcessTable, StdinSource,
    ToolCommand, ToolSpec,
};
use crate::events::{EventKind, EventSink, ProgressEvent};
use crate::probe::{
    classify, collect_alive, parse_curl_output, probe_stream, probe_urls, Liveness, ProbeError,
    ProbeOutcome, ProbeSettings, Prober, UnreachableReason,
};
use crate::runner::{Options, Runner, RunnerError};
use crate::session::{
    Pipeline, PipelineSettings, ScanSession, SessionId, SessionState, Stage, StageContext,
};
use crate::urls::{dedup_by_parameter_shape, filter_parameterized, normalize_origin};

struct FakeProber {
    responses: HashMap<String, (u16, String)>,
}

impl FakeProber {
    fn new(responses: &[(&str, u16, &str)]) -> Arc<Self> {
        Arc::new(Self {
            responses: responses
                .iter()
                .map(|(url, status, final_url)| (url.to_string(), (*status, final_url.to_string())))
                .collect(),
        })
    }
}

// anything without a canned response behaves like a host that never answers
#[async_trait]
impl Prober for FakeProber {
    async fn probe(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        Ok(match self.responses.get(url) {
            Some((status, final_url)) => ProbeOutcome::Responded {
                status: *status,
                final_url: final_url.clone(),
            },
            None => ProbeOutcome::Unreachable(UnreachableReason::Timeout),
        })
    }
}

// answers every url with a timeout and counts how often it was asked
#[derive(Default)]
struct CountingProber {
    calls: AtomicUsize,
}

#[async_trait]
impl Prober for CountingProber {
    async fn probe(
        &self,
        _url: &str,
        _cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeOutcome::Unreachable(UnreachableReason::Timeout))
    }
}

fn sh(script: &str) -> ToolSpec {
    ToolSpec::new("sh", &["-c", script])
}

fn sh_command(script: &str) -> ToolCommand {
    ToolCommand::new("sh").args(["-c", script])
}

fn settings(enumerator: ToolSpec, crawler: ToolSpec, scanner: ToolSpec) -> PipelineSettings {
    PipelineSettings {
        enumerator,
        crawler,
        scanner,
        ..PipelineSettings::default()
    }
}

async fn run_one(
    dir: &Path,
    settings: PipelineSettings,
    prober: Arc<dyn Prober>,
    domain: &str,
) -> (ScanSession, Vec<ProgressEvent>) {
    let pipeline = Pipeline::new(settings, prober, ArtifactStore::new(dir), ProcessTable::new());
    let (tx, mut rx) = mpsc::channel(1024);
    let session = pipeline
        .run_session(SessionId(1), domain.to_string(), tx, CancellationToken::new())
        .await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (session, events)
}

fn started_stages(events: &[ProgressEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e.event {
            EventKind::StageStarted { stage } => Some(stage),
            _ => None,
        })
        .collect()
}

async fn read_artifact(dir: &Path, domain: &str, kind: ArtifactKind) -> Option<Vec<String>> {
    ArtifactStore::new(dir).read_lines(domain, kind).await.unwrap()
}

const SCENARIO_CRAWL: &str = "cat '{targets}' > /dev/null; \
     printf 'http://a.example.com/p?x=1\\nhttp://a.example.com/p?x=2\\nhttp://a.example.com/q\\n'";

fn scenario_prober() -> Arc<FakeProber> {
    FakeProber::new(&[
        ("http://a.example.com", 200, "http://a.example.com/"),
        ("https://b.example.com", 404, "https://b.example.com/"),
    ])
}

#[test]
fn dedup_keeps_first_of_each_shape_and_is_idempotent() {
    let input = vec![
        "https://a.com/p?x=1",
        "https://a.com/p?x=2",
        "https://a.com/q",
        "https://a.com/p?y=1&x=1",
        "https://a.com/p?x=5&y=0",
        "not a url",
        "",
    ];
    let once = dedup_by_parameter_shape(&input);
    assert_eq!(
        once,
        vec![
            "https://a.com/p?x=1".to_string(),
            "https://a.com/q".to_string(),
            "https://a.com/p?y=1&x=1".to_string(),
        ]
    );
    assert_eq!(dedup_by_parameter_shape(&once), once);
}

#[test]
fn origin_normalization_is_idempotent() {
    let origin = normalize_origin("https://a.com/path?x=1").unwrap();
    assert_eq!(origin.to_string(), "https://a.com/");
    let again = normalize_origin(&origin.to_string()).unwrap();
    assert_eq!(again, origin);
}

#[test]
fn parameterized_filter_keeps_only_query_urls() {
    let kept = filter_parameterized(&[
        "https://a.com/p?x=1",
        "https://a.com/q",
        "https://a.com/r?",
    ]);
    assert_eq!(kept, vec!["https://a.com/p?x=1".to_string()]);
}

#[test]
fn classification_separates_alive_dead_and_unreachable() {
    let statuses = crate::probe::default_alive_statuses();
    for status in [200, 301, 302] {
        let l = classify(
            ProbeOutcome::Responded {
                status,
                final_url: "https://a.com/x".to_string(),
            },
            &statuses,
        );
        assert!(l.is_alive(), "{status} should be alive");
        assert_eq!(l.origin().unwrap().to_string(), "https://a.com/");
    }
    let dead = classify(
        ProbeOutcome::Responded {
            status: 404,
            final_url: "https://a.com/".to_string(),
        },
        &statuses,
    );
    assert!(matches!(dead, Liveness::Dead { status: 404, .. }));
    let timeout = classify(ProbeOutcome::Unreachable(UnreachableReason::Timeout), &statuses);
    assert_eq!(
        timeout,
        Liveness::Unreachable {
            reason: UnreachableReason::Timeout
        }
    );
    assert_ne!(timeout, dead);
}

#[test]
fn curl_output_is_parsed() {
    assert_eq!(
        parse_curl_output("301 https://a.com/login\n", "http://a.com"),
        ProbeOutcome::Responded {
            status: 301,
            final_url: "https://a.com/login".to_string(),
        }
    );
    assert_eq!(
        parse_curl_output("200", "http://a.com"),
        ProbeOutcome::Responded {
            status: 200,
            final_url: "http://a.com".to_string(),
        }
    );
    assert!(matches!(
        parse_curl_output("000 http://a.com/", "http://a.com"),
        ProbeOutcome::Unreachable(UnreachableReason::Connect(_))
    ));
    assert!(matches!(
        parse_curl_output("garbage", "http://a.com"),
        ProbeOutcome::Unreachable(UnreachableReason::MalformedOutput(_))
    ));
}

#[test]
fn placeholders_expand_only_exact_tokens() {
    let vars = [("domain", "example.com"), ("url", "http://x")];
    assert_eq!(expand_placeholders("{domain}", &vars), "example.com");
    assert_eq!(expand_placeholders("-d={domain}", &vars), "-d=example.com");
    assert_eq!(
        expand_placeholders("%{http_code} %{url_effective}", &vars),
        "%{http_code} %{url_effective}"
    );
    assert_eq!(expand_placeholders("{unknown}", &vars), "{unknown}");
}

#[test]
fn probe_urls_are_http_first_then_https() {
    let urls = probe_urls(&["a.example.com".to_string(), "b.example.com".to_string()]);
    assert_eq!(
        urls,
        vec![
            "http://a.example.com",
            "http://b.example.com",
            "https://a.example.com",
            "https://b.example.com",
        ]
    );
}

#[tokio::test]
async fn probe_stream_keeps_order_and_collects_unique_origins() {
    let prober = FakeProber::new(&[
        ("http://a.example.com", 301, "https://a.example.com/login"),
        ("https://a.example.com", 200, "https://a.example.com/"),
        ("http://b.example.com", 500, "http://b.example.com/"),
    ]);
    let settings = ProbeSettings {
        concurrency: 3,
        ..ProbeSettings::default()
    };
    let cancel = CancellationToken::new();
    let urls = probe_urls(&["a.example.com".to_string(), "b.example.com".to_string()]);
    let results: Vec<(String, Liveness)> = probe_stream(prober.as_ref(), urls.clone(), &settings, &cancel)
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(results.iter().map(|(u, _)| u.clone()).collect::<Vec<_>>(), urls);
    let alive = collect_alive(results.iter().map(|(_, l)| l));
    assert_eq!(
        alive.iter().map(|o| o.to_string()).collect::<Vec<_>>(),
        vec!["https://a.example.com/".to_string()]
    );
}

#[tokio::test]
async fn probe_stream_stops_when_cancelled() {
    let prober = FakeProber::new(&[]);
    let settings = ProbeSettings::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut stream = Box::pin(probe_stream(
        prober.as_ref(),
        vec!["http://a.example.com".to_string()],
        &settings,
        &cancel,
    ));
    assert!(matches!(stream.next().await, Some(Err(ProbeError::Cancelled))));
}

#[tokio::test]
async fn artifact_tokens_cannot_escape_the_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let store = ArtifactStore::new(&out);
    store.prepare().await.unwrap();
    std::fs::write(dir.path().join("secret.txt"), "x").unwrap();
    store
        .write_lines("example.com", ArtifactKind::Crawl, ["http://a/"])
        .await
        .unwrap();

    let resolved = store.resolve("example.com_crawl.txt").await.unwrap();
    assert!(resolved.ends_with("example.com_crawl.txt"));

    for token in ["", "../secret.txt", "..", ".", "/etc/passwd", "a/b.txt", "..\\secret.txt"] {
        assert!(
            matches!(
                store.resolve(token).await,
                Err(ArtifactError::InvalidToken { .. })
            ),
            "token {token:?} should be rejected"
        );
    }
    assert!(matches!(
        store.resolve("missing.txt").await,
        Err(ArtifactError::NotFound { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn artifact_symlinks_out_of_the_output_dir_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let store = ArtifactStore::new(&out);
    store.prepare().await.unwrap();
    std::fs::write(dir.path().join("secret.txt"), "x").unwrap();
    std::os::unix::fs::symlink(dir.path().join("secret.txt"), out.join("link.txt")).unwrap();
    assert!(store.resolve("link.txt").await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn streaming_yields_lines_and_reports_exit_code() {
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();
    let cmd = sh_command("printf 'one\\n\\ntwo\\n'; echo oops >&2; exit 3");
    let mut stream = run_streaming(&cmd, &processes, &cancel).await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("one"));
    assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("two"));
    assert_eq!(stream.next_line().await.unwrap(), None);
    let exit = stream.finish().await.unwrap();
    assert_eq!(exit.exit_code, Some(3));
    assert!(!exit.success());
    assert_eq!(exit.stderr, "oops");
    assert!(processes.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn streaming_is_lazy() {
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();
    // the second line only appears long after the first
    let cmd = sh_command("echo first; sleep 5; echo second").timeout(Duration::from_secs(30));
    let mut stream = run_streaming(&cmd, &processes, &cancel).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(3), stream.next_line())
        .await
        .expect("first line should arrive before the tool exits")
        .unwrap();
    assert_eq!(first.as_deref(), Some("first"));
    cancel.cancel();
    assert!(matches!(
        stream.next_line().await,
        Err(CommandError::Cancelled { .. })
    ));
}

#[tokio::test]
async fn launch_failure_is_distinct_from_non_zero_exit() {
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();
    let missing = ToolCommand::new("/nonexistent/reconpipe-test-tool");
    let err = run_buffered(&missing, &processes, &cancel).await.unwrap_err();
    assert!(err.is_launch());
    assert!(processes.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn non_zero_exit_is_an_output_not_an_error() {
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();
    let output = run_buffered(&sh_command("echo partial; exit 2"), &processes, &cancel)
        .await
        .unwrap();
    assert_eq!(output.exit_code, Some(2));
    assert_eq!(output.stdout_lines, vec!["partial".to_string()]);
}

#[cfg(unix)]
#[tokio::test]
async fn timeout_kills_the_tool() {
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();
    let cmd = sh_command("echo started; sleep 30").timeout(Duration::from_millis(300));
    let started = std::time::Instant::now();
    let err = run_buffered(&cmd, &processes, &cancel).await.unwrap_err();
    assert!(matches!(err, CommandError::TimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(processes.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn stdin_is_piped_from_file_and_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "a\nb\n").unwrap();
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();

    let from_file = ToolCommand::new("cat").stdin(StdinSource::File(input));
    let output = run_buffered(&from_file, &processes, &cancel).await.unwrap();
    assert_eq!(output.stdout_lines, vec!["a".to_string(), "b".to_string()]);

    let from_bytes = ToolCommand::new("cat").stdin(StdinSource::Bytes(b"c\n".to_vec()));
    let output = run_buffered(&from_bytes, &processes, &cancel).await.unwrap();
    assert_eq!(output.stdout_lines, vec!["c".to_string()]);
}

#[cfg(unix)]
#[tokio::test]
async fn process_table_drains_after_cancellation() {
    let processes = ProcessTable::new();
    let cancel = CancellationToken::new();
    let cmd = sh_command("sleep 30");
    let handle = tokio::spawn({
        let processes = processes.clone();
        let cancel = cancel.clone();
        async move { run_buffered(&cmd, &processes, &cancel).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while processes.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(processes.active()[0].program, "sh");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), processes.drained())
        .await
        .unwrap();
    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
}

#[cfg(unix)]
#[tokio::test]
async fn scenario_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(
        sh("printf 'a.example.com\\nb.example.com\\n'"),
        sh(SCENARIO_CRAWL),
        sh("while read -r line; do echo \"POC $line\"; done"),
    );
    let (session, events) = run_one(dir.path(), settings, scenario_prober(), "example.com").await;

    assert_eq!(session.state, SessionState::Done, "{:?}", session.failure);
    assert_eq!(session.subdomains, vec!["a.example.com", "b.example.com"]);
    assert_eq!(
        session.alive.iter().map(|o| o.to_string()).collect::<Vec<_>>(),
        vec!["http://a.example.com/".to_string()]
    );
    assert_eq!(started_stages(&events), Stage::ALL.to_vec());

    let probes: HashMap<String, Liveness> = events
        .iter()
        .filter_map(|e| match &e.event {
            EventKind::Probe { url, liveness } => Some((url.clone(), liveness.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(probes.len(), 4);
    assert!(probes["http://a.example.com"].is_alive());
    assert!(matches!(
        probes["https://b.example.com"],
        Liveness::Dead { status: 404, .. }
    ));
    assert!(matches!(
        probes["http://b.example.com"],
        Liveness::Unreachable {
            reason: UnreachableReason::Timeout
        }
    ));

    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Alive).await,
        Some(vec!["http://a.example.com/".to_string()])
    );
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Crawl).await,
        Some(vec![
            "http://a.example.com/p?x=1".to_string(),
            "http://a.example.com/q".to_string(),
        ])
    );
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Parameters).await,
        Some(vec!["http://a.example.com/p?x=1".to_string()])
    );
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Xss).await,
        Some(vec!["POC http://a.example.com/p?x=1".to_string()])
    );
    assert_eq!(session.artifacts().len(), 5);

    let crawl_discoveries = events
        .iter()
        .filter(|e| {
            matches!(
                e.event,
                EventKind::Discovery {
                    stage: Stage::Crawl,
                    ..
                }
            )
        })
        .count();
    assert_eq!(crawl_discoveries, 3);
    assert!(matches!(
        events.last().map(|e| &e.event),
        Some(EventKind::SessionFinished {
            state: SessionState::Done
        })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn scenario_no_parameterized_urls_skips_scanner() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("scanner-ran");
    let scanner = sh(&format!("touch '{}'", marker.display()));
    let settings = settings(
        sh("echo a.example.com"),
        sh("printf 'http://a.example.com/q\\nhttp://a.example.com/about\\n'"),
        scanner,
    );
    let (session, events) = run_one(dir.path(), settings, scenario_prober(), "example.com").await;

    assert_eq!(session.state, SessionState::Done);
    assert!(session.xss_artifact.is_none());
    assert!(!marker.exists());
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Parameters).await,
        Some(Vec::new())
    );
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Xss).await,
        None
    );
    assert!(events.iter().any(|e| matches!(
        e.event,
        EventKind::StageSkipped {
            stage: Stage::ScanXss,
            ..
        }
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn no_live_origins_skips_crawler() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crawler-ran");
    let settings = settings(
        sh("echo nothing.example.com"),
        sh(&format!("touch '{}'", marker.display())),
        sh("cat"),
    );
    let (session, events) = run_one(dir.path(), settings, FakeProber::new(&[]), "example.com").await;

    assert_eq!(session.state, SessionState::Done);
    assert!(session.alive.is_empty());
    assert!(!marker.exists());
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Alive).await,
        Some(Vec::new())
    );
    assert!(events.iter().any(|e| matches!(
        e.event,
        EventKind::StageSkipped {
            stage: Stage::Crawl,
            ..
        }
    )));
}

#[tokio::test]
async fn enumeration_launch_failure_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(
        ToolSpec::new("/nonexistent/reconpipe-subfinder", &["-d", "{domain}"]),
        ToolSpec::new("/nonexistent/reconpipe-katana", &[]),
        ToolSpec::new("/nonexistent/reconpipe-dalfox", &[]),
    );
    let (session, events) = run_one(dir.path(), settings, scenario_prober(), "example.com").await;

    assert_eq!(session.state, SessionState::Failed(Stage::Enumerate));
    assert!(session.failure.is_some());
    assert_eq!(started_stages(&events), vec![Stage::Enumerate]);
    assert!(!events
        .iter()
        .any(|e| matches!(e.event, EventKind::Probe { .. })));
    assert!(events.iter().any(|e| matches!(
        e.event,
        EventKind::Error {
            stage: Stage::Enumerate,
            ..
        }
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn enumeration_non_zero_exit_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(
        sh("echo a.example.com; echo 'rate limited' >&2; exit 1"),
        sh("cat"),
        sh("cat"),
    );
    let (session, _) = run_one(dir.path(), settings, scenario_prober(), "example.com").await;
    assert_eq!(session.state, SessionState::Failed(Stage::Enumerate));
    assert!(session.failure.unwrap().contains("rate limited"));
}

#[cfg(unix)]
#[tokio::test]
async fn crawler_timeout_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(
        sh("echo a.example.com"),
        sh("echo 'http://a.example.com/p?x=1'; sleep 30"),
        sh("cat > /dev/null"),
    );
    settings.timeouts.crawl = Duration::from_millis(500);
    let (session, events) = run_one(dir.path(), settings, scenario_prober(), "example.com").await;

    assert_eq!(session.state, SessionState::Done, "{:?}", session.failure);
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Crawl).await,
        Some(vec!["http://a.example.com/p?x=1".to_string()])
    );
    assert!(events.iter().any(|e| matches!(
        e.event,
        EventKind::Error {
            stage: Stage::Crawl,
            ..
        }
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn malformed_enumerator_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(
        sh("printf 'A.Example.com.\\nnot a host\\na.example.com\\n\\n'"),
        sh("cat > /dev/null"),
        sh("cat > /dev/null"),
    );
    let (session, _) = run_one(dir.path(), settings, FakeProber::new(&[]), "example.com").await;
    assert_eq!(session.subdomains, vec!["a.example.com".to_string()]);
}

#[tokio::test]
async fn cancelled_session_ends_failed() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(
        PipelineSettings::default(),
        scenario_prober(),
        ArtifactStore::new(dir.path()),
        ProcessTable::new(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, mut rx) = mpsc::channel(64);
    let session = pipeline
        .run_session(SessionId(7), "example.com".to_string(), tx, cancel)
        .await;
    assert_eq!(session.state, SessionState::Failed(Stage::Enumerate));
    assert_eq!(session.failure.as_deref(), Some("cancelled"));
    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.session, SessionId(7));
    assert!(matches!(last.event, EventKind::SessionFinished { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn runner_runs_every_domain_within_the_session_limit() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        domains: vec!["Example.com".to_string(), "example.org".to_string()],
        output_dir: dir.path().join("out").display().to_string(),
        max_sessions: 1,
        enumerator: sh("echo a.{domain}"),
        crawler: sh("cat > /dev/null"),
        scanner: sh("cat > /dev/null"),
        ..Options::default()
    };
    let runner = Runner::with_prober(options, FakeProber::new(&[])).unwrap();
    let (tx, mut rx) = mpsc::channel(1024);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let summary = runner.run(tx).await.unwrap();
    let events = collector.await.unwrap();

    assert_eq!(summary.sessions.len(), 2);
    assert_eq!(summary.failed(), 0);
    assert_eq!(summary.sessions[0].domain, "example.com");
    assert_eq!(summary.sessions[0].subdomains, vec!["a.example.com".to_string()]);
    assert_eq!(summary.sessions[1].domain, "example.org");

    // with one slot the second session only starts after the first finished
    let first_finished = events
        .iter()
        .position(|e| {
            e.session == summary.sessions[0].id
                && matches!(e.event, EventKind::SessionFinished { .. })
        })
        .unwrap();
    let second_started = events
        .iter()
        .position(|e| {
            e.session == summary.sessions[1].id && matches!(e.event, EventKind::SessionStarted)
        })
        .unwrap();
    assert!(first_finished < second_started);
    assert!(dir.path().join("out").join("example.org_subdomains.txt").exists());
}

#[tokio::test]
async fn runner_rejects_bad_options() {
    let no_targets = Runner::with_prober(Options::default(), FakeProber::new(&[])).unwrap();
    let (tx, _rx) = mpsc::channel(1);
    assert!(matches!(
        no_targets.run(tx).await,
        Err(RunnerError::NoTargets)
    ));

    let bad_domain = Options {
        domains: vec!["http://example.com/".to_string()],
        ..Options::default()
    };
    assert!(matches!(
        Runner::with_prober(bad_domain, FakeProber::new(&[])),
        Err(RunnerError::InvalidDomain { .. })
    ));

    let zero_sessions = Options {
        max_sessions: 0,
        ..Options::default()
    };
    assert!(matches!(
        Runner::with_prober(zero_sessions, FakeProber::new(&[])),
        Err(RunnerError::InvalidMaxSessions { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn runner_shutdown_stops_running_tools() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        domains: vec!["example.com".to_string()],
        output_dir: dir.path().display().to_string(),
        enumerator: sh("sleep 30"),
        ..Options::default()
    };
    let runner = Arc::new(Runner::with_prober(options, FakeProber::new(&[])).unwrap());
    let (tx, mut rx) = mpsc::channel(1024);
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run(tx).await }
    });
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.processes().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner.shutdown())
        .await
        .unwrap();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.sessions.len(), 1);
    assert_eq!(
        summary.sessions[0].state,
        SessionState::Failed(Stage::Enumerate)
    );
}

#[cfg(unix)]
#[tokio::test]
async fn scanner_non_zero_exit_keeps_findings_and_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(
        sh("echo a.example.com"),
        sh(SCENARIO_CRAWL),
        sh("cat > /dev/null; echo finding; echo boom >&2; exit 4"),
    );
    let (session, events) = run_one(dir.path(), settings, scenario_prober(), "example.com").await;

    assert_eq!(session.state, SessionState::Done, "{:?}", session.failure);
    let errors: Vec<&String> = events
        .iter()
        .filter_map(|e| match &e.event {
            EventKind::Error {
                stage: Stage::ScanXss,
                error,
            } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("boom"), "{}", errors[0]);
    assert_eq!(
        read_artifact(dir.path(), "example.com", ArtifactKind::Xss).await,
        Some(vec!["finding".to_string()])
    );
    assert_eq!(session.findings, 1);
    assert!(events.iter().any(|e| matches!(
        e.event,
        EventKind::ArtifactReady {
            stage: Stage::ScanXss,
            ..
        }
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn same_domain_sessions_run_one_after_another() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("enumerator.log");
    let enumerator = sh(&format!(
        "echo start >> '{log}'; sleep 0.3; echo end >> '{log}'",
        log = log.display()
    ));
    let settings = settings(enumerator, sh("cat > /dev/null"), sh("cat > /dev/null"));
    let pipeline = Pipeline::new(
        settings,
        FakeProber::new(&[]),
        ArtifactStore::new(dir.path().join("out")),
        ProcessTable::new(),
    );
    pipeline.store().prepare().await.unwrap();
    let (tx_a, _rx_a) = mpsc::channel(1024);
    let (tx_b, _rx_b) = mpsc::channel(1024);

    let (a, b) = tokio::join!(
        pipeline.run_session(SessionId(1), "example.com".to_string(), tx_a, CancellationToken::new()),
        pipeline.run_session(SessionId(2), "example.com".to_string(), tx_b, CancellationToken::new()),
    );

    assert_eq!(a.state, SessionState::Done, "{:?}", a.failure);
    assert_eq!(b.state, SessionState::Done, "{:?}", b.failure);
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "start\nend\nstart\nend\n"
    );
    // the lock for a domain is dropped once its last session is done
    assert_eq!(pipeline.store().tracked_domains(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn dropped_event_consumer_cancels_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(
        sh("sleep 0.3; echo a.example.com"),
        sh("cat > /dev/null"),
        sh("cat > /dev/null"),
    );
    let pipeline = Pipeline::new(
        settings,
        scenario_prober(),
        ArtifactStore::new(dir.path()),
        ProcessTable::new(),
    );
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(1024);

    let consumer = async move {
        while let Some(event) = rx.recv().await {
            if matches!(
                event.event,
                EventKind::StageStarted {
                    stage: Stage::Enumerate
                }
            ) {
                break;
            }
        }
        drop(rx);
    };
    let (session, ()) = tokio::join!(
        pipeline.run_session(SessionId(1), "example.com".to_string(), tx, cancel.clone()),
        consumer,
    );

    assert!(session.state.is_failed(), "{}", session.state);
    assert_eq!(session.failure.as_deref(), Some("cancelled"));
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn validation_keeps_probing_while_events_back_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.prepare().await.unwrap();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let ctx = StageContext {
        domain: "example.com".to_string(),
        store,
        processes: ProcessTable::new(),
        cancel: cancel.clone(),
        events: EventSink::new(tx, SessionId(1), "example.com", cancel),
    };
    let prober = CountingProber::default();
    let settings = ProbeSettings {
        concurrency: 1,
        ..ProbeSettings::default()
    };
    let hosts: Vec<String> = (0..4).map(|i| format!("h{i}.example.com")).collect();

    let validate = crate::probe::validate(&ctx, &prober, &settings, &hosts);
    futures::pin_mut!(validate);

    // nobody reads events yet, every url still gets probed
    let all_probed = async {
        while prober.calls.load(Ordering::SeqCst) < 8 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::select! {
        _ = &mut validate => panic!("validation finished with unread events"),
        waited = tokio::time::timeout(Duration::from_secs(5), all_probed) => waited.unwrap(),
    }

    let mut received = 0;
    let outcome = loop {
        tokio::select! {
            outcome = &mut validate => break outcome.unwrap(),
            Some(_) = rx.recv() => received += 1,
        }
    };
    assert!(outcome.alive.is_empty());
    while rx.try_recv().is_ok() {
        received += 1;
    }
    // one probe and one progress event per url, then the summary and artifact
    assert!(received >= 16, "{received}");
}
