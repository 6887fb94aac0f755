use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{error::ErrorKind, CommandFactory, Parser};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::args::CliArgs;
use crate::cli::validation;
use crate::config::{self, ConfigFile};
use crate::events::{EventKind, ProgressEvent};
use crate::output::{self, OutputFormat};
use crate::runner::{Options, ProbeBackend, Runner, RunnerError};
use crate::session::SessionId;
use crate::{crawler, enumerate, probe, xss};

fn print_banner() {
    const BANNER: &str = r#"
                                        _
   _ __ ___  ___ ___  _ __  _ __ (_)_ __   ___
  | '__/ _ \/ __/ _ \| '_ \| '_ \| | '_ \ / _ \
  | | |  __/ (_| (_) | | | | |_) | | |_) |  __/
  |_|  \___|\___\___/|_| |_| .__/|_| .__/ \___|
                           |_|     |_|
       recon pipeline orchestrator
    "#;
    eprint!("{}", BANNER);
    eprintln!();
}

fn format_kv_line(label: &str, value: &str) {
    eprintln!(":: {:<10}: {}", label, value);
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("reconpipe={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

struct RunConfig {
    options: Options,
    workers: usize,
    format: OutputFormat,
    events_file: Option<PathBuf>,
    stdin: bool,
    no_color: bool,
    verbose: u8,
}

fn build_run_config(args: CliArgs, cfg: ConfigFile) -> Result<RunConfig, String> {
    validation::validate(&args)?;

    let no_color = if args.color {
        false
    } else {
        args.no_color || cfg.no_color.unwrap_or(false)
    };
    let json = args.json || (args.events.is_none() && cfg.json.unwrap_or(false));
    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let events_file = if args.json {
        None
    } else {
        args.events
            .or(cfg.events)
            .filter(|p| !p.trim().is_empty())
            .map(|p| config::expand_tilde(&p))
    };

    let domains = if args.domain.is_empty() {
        cfg.domains.unwrap_or_default()
    } else {
        args.domain.clone()
    };
    let input_file = args
        .input_file
        .or(cfg.input_file)
        .filter(|p| !p.trim().is_empty())
        .map(|p| config::expand_tilde_string(&p));
    if domains.is_empty() && input_file.is_none() && !args.stdin {
        return Err(
            "at least one input mode must be specified (--domain, --input-file, or --stdin)"
                .to_string(),
        );
    }
    for domain in domains.iter() {
        crate::utils::normalize_domain(domain)
            .map_err(|e| format!("invalid domain in config: {e}"))?;
    }

    let output_dir = config::expand_tilde_string(
        args.output_dir
            .or(cfg.output_dir)
            .unwrap_or_else(|| "./output".to_string())
            .as_str(),
    );
    let max_sessions = args.max_sessions.or(cfg.max_sessions).unwrap_or(2);
    if max_sessions == 0 {
        return Err("invalid max_sessions, expected positive integer".to_string());
    }
    let workers = args.workers.or(cfg.workers).unwrap_or(10).max(1);
    let rate = args.rate.or(cfg.rate).unwrap_or(0);
    let probe_concurrency = args
        .probe_concurrency
        .or(cfg.probe_concurrency)
        .unwrap_or(10)
        .max(1);
    let probe_timeout_seconds = args.probe_timeout.or(cfg.probe_timeout).unwrap_or(10).max(1);

    let backend_raw = args
        .probe_backend
        .or(cfg.probe_backend)
        .unwrap_or_else(|| "http".to_string());
    let probe_backend = ProbeBackend::parse(&backend_raw)?;

    let alive_raw = args
        .alive_status
        .or(cfg.alive_status)
        .unwrap_or_else(|| "200,301,302".to_string());
    let alive_statuses = crate::utils::parse_u16_set_csv(&alive_raw)
        .map_err(|e| format!("invalid --alive-status '{alive_raw}': {e}"))?;

    let proxy = args.proxy.or(cfg.proxy).filter(|p| !p.trim().is_empty());

    let enumerate_timeout_seconds = args
        .enumerate_timeout
        .or(cfg.enumerate_timeout)
        .unwrap_or(600)
        .max(1);
    let crawl_timeout_seconds = args.crawl_timeout.or(cfg.crawl_timeout).unwrap_or(1800).max(1);
    let scan_timeout_seconds = args.scan_timeout.or(cfg.scan_timeout).unwrap_or(1800).max(1);

    let tools = cfg.tools.unwrap_or_default();
    let options = Options {
        domains,
        input_file,
        output_dir,
        max_sessions,
        enumerator: tools.enumerator.unwrap_or_else(enumerate::default_tool),
        crawler: tools.crawler.unwrap_or_else(crawler::default_tool),
        scanner: tools.scanner.unwrap_or_else(xss::default_tool),
        curl: tools.curl.unwrap_or_else(probe::default_curl_tool),
        probe_backend,
        probe_timeout_seconds,
        probe_concurrency,
        rate,
        alive_statuses,
        proxy,
        enumerate_timeout_seconds,
        crawl_timeout_seconds,
        scan_timeout_seconds,
    };

    Ok(RunConfig {
        options,
        workers,
        format,
        events_file,
        stdin: args.stdin,
        no_color,
        verbose: args.verbose,
    })
}

fn print_settings(run: &RunConfig) {
    let o = &run.options;
    let mut statuses: Vec<u16> = o.alive_statuses.iter().copied().collect();
    statuses.sort_unstable();
    let statuses = statuses
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",");

    eprintln!("________________________________________________");
    eprintln!();
    if !o.domains.is_empty() {
        format_kv_line("Domains", &o.domains.join(", "));
    }
    if let Some(path) = o.input_file.as_deref() {
        format_kv_line("Input", path);
    }
    if run.stdin {
        format_kv_line("Stdin", "reading domains");
    }
    format_kv_line("Output", &o.output_dir);
    format_kv_line("Sessions", &o.max_sessions.to_string());
    format_kv_line("Enumerate", &o.enumerator.program);
    format_kv_line(
        "Probe",
        &format!(
            "{} (timeout {}s, concurrency {})",
            o.probe_backend.as_str(),
            o.probe_timeout_seconds,
            o.probe_concurrency
        ),
    );
    format_kv_line("Alive", &statuses);
    format_kv_line("Crawl", &o.crawler.program);
    format_kv_line("Scan", &o.scanner.program);
    if let Some(proxy) = o.proxy.as_deref() {
        format_kv_line("Proxy", proxy);
    }
    if let Some(path) = run.events_file.as_ref() {
        format_kv_line("Events", &path.display().to_string());
    }
    eprintln!("________________________________________________");
    eprintln!();
}

struct EventPrinter {
    format: OutputFormat,
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<SessionId, ProgressBar>,
    events_file: Option<(PathBuf, tokio::fs::File)>,
}

impl EventPrinter {
    async fn new(format: OutputFormat, events_file: Option<PathBuf>) -> Result<Self, String> {
        let style = ProgressStyle::with_template(
            ":: Progress: [{pos}/{len}] :: {per_sec} :: Duration: [{elapsed_precise}] :: {msg}",
        )
        .map_err(|e| format!("failed to build progress bar style: {e}"))?
        .progress_chars(r#"#>-"#);

        let events_file = match events_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|e| format!("failed to open events file {}: {e}", path.display()))?;
                Some((path, file))
            }
            None => None,
        };

        Ok(Self {
            format,
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            style,
            bars: HashMap::new(),
            events_file,
        })
    }

    async fn handle(&mut self, event: ProgressEvent) {
        if let Some((path, file)) = self.events_file.as_mut() {
            let mut line = output::render_json(&event);
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!("failed to write events file {}: {e}", path.display());
                self.events_file = None;
            }
        }

        if self.format == OutputFormat::Json {
            println!("{}", output::render_json(&event));
            return;
        }

        if let EventKind::Progress { stage, done, total } = &event.event {
            let bar = self.bars.entry(event.session).or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(*total as u64));
                pb.set_style(self.style.clone());
                pb.set_message(format!("{} {}", event.domain, stage));
                pb
            });
            bar.set_length(*total as u64);
            bar.set_position(*done as u64);
            if done >= total {
                bar.finish_and_clear();
                self.bars.remove(&event.session);
            }
            return;
        }

        if matches!(event.event, EventKind::SessionFinished { .. }) {
            if let Some(bar) = self.bars.remove(&event.session) {
                bar.finish_and_clear();
            }
        }
        if let Some(line) = output::render_text(&event) {
            self.multi.suspend(|| println!("{line}"));
        }
    }

    async fn finish(mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
        if let Some((path, mut file)) = self.events_file.take() {
            if let Err(e) = file.flush().await {
                warn!("failed to flush events file {}: {e}", path.display());
            }
        }
    }
}

async fn print_events(
    mut rx: mpsc::Receiver<ProgressEvent>,
    mut printer: EventPrinter,
) {
    while let Some(event) = rx.recv().await {
        printer.handle(event).await;
    }
    printer.finish().await;
}

async fn feed_domains(runner: &Runner, tx: mpsc::Sender<String>, stdin: bool) -> Result<(), String> {
    match runner.load_targets().await {
        Ok(targets) => {
            for domain in targets {
                if tx.send(domain).await.is_err() {
                    return Ok(());
                }
            }
        }
        Err(RunnerError::NoTargets) if stdin => {}
        Err(e) => return Err(e.to_string()),
    }
    if !stdin {
        return Ok(());
    }

    let cancel = runner.cancellation();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => return Err(format!("failed to read stdin: {e}")),
        }
    }
    Ok(())
}

async fn run_async(run: RunConfig) -> Result<(), String> {
    if run.no_color {
        colored::control::set_override(false);
    }
    if run.format == OutputFormat::Text {
        print_banner();
        print_settings(&run);
    }

    let runner = Arc::new(Runner::new(run.options.clone()).map_err(|e| e.to_string())?);
    let printer = EventPrinter::new(run.format, run.events_file.clone()).await?;

    let (events_tx, events_rx) = mpsc::channel::<ProgressEvent>(1024);
    let printer_handle = task::spawn(print_events(events_rx, printer));

    let interrupt_handle = task::spawn({
        let runner = runner.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "{}",
                    ":: Interrupted :: stopping sessions and external tools".bold().yellow()
                );
                runner.shutdown().await;
            }
        }
    });

    let (domain_tx, domain_rx) = mpsc::channel::<String>(64);
    let feeder_handle = task::spawn({
        let runner = runner.clone();
        let stdin = run.stdin;
        async move { feed_domains(&runner, domain_tx, stdin).await }
    });

    let served = runner.serve(domain_rx, events_tx).await;
    interrupt_handle.abort();
    let fed = match feeder_handle.await {
        Ok(result) => result,
        Err(e) => Err(format!("domain feeder failed: {e}")),
    };
    if printer_handle.await.is_err() {
        warn!("event printer task failed");
    }
    runner.processes().drained().await;

    let summary = served.map_err(|e| e.to_string())?;
    fed?;
    if summary.sessions.is_empty() {
        return Err("no valid domains were submitted".to_string());
    }

    if run.format == OutputFormat::Text {
        eprintln!();
        for session in summary.sessions.iter() {
            eprintln!("{}", output::render_summary(session));
        }
        eprintln!();
        eprintln!(
            ":: Completed :: {} sessions in {}s ::",
            summary.sessions.len(),
            summary.elapsed.as_secs()
        );
    }
    info!(
        sessions = summary.sessions.len(),
        failed = summary.failed(),
        "run finished"
    );

    let failed = summary.failed();
    if failed > 0 {
        return Err(format!(
            "{failed} of {} sessions failed",
            summary.sessions.len()
        ));
    }
    Ok(())
}

pub fn run_cli() -> Result<(), String> {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp => {
                print!("{}", CliArgs::command().render_long_help());
                return Ok(());
            }
            ErrorKind::DisplayVersion => {
                let cmd = CliArgs::command();
                print!("{}", cmd.render_version());
                return Ok(());
            }
            _ => return Err(e.to_string()),
        },
    };

    let user_config_path = args.config.clone().map(|p| config::expand_tilde(&p));
    if args.init_config {
        let path = user_config_path
            .or_else(config::default_config_path)
            .ok_or_else(|| "could not determine home directory for config".to_string())?;
        if config::ensure_default_config_file(&path)? {
            println!(":: Config    : wrote {}", path.display());
        } else {
            println!(":: Config    : {} already exists", path.display());
        }
        return Ok(());
    }

    let cfg = match user_config_path.as_ref() {
        Some(path) => config::load_config(path, false)?,
        None => match config::default_config_path() {
            Some(path) => config::load_config(&path, true)?,
            None => ConfigFile::default(),
        },
    };

    let run = build_run_config(args, cfg)?;
    init_tracing(run.verbose);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(run.workers)
        .build()
        .map_err(|e| format!("failed to build runtime: {e}"))?;

    let result = rt.block_on(run_async(run));
    // a pending stdin read lives on a blocking thread and would hold the
    // runtime open
    rt.shutdown_timeout(Duration::from_millis(250));
    result
}
