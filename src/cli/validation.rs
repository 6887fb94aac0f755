use crate::cli::args::CliArgs;

pub fn validate(args: &CliArgs) -> Result<(), String> {
    if let Some(max_sessions) = args.max_sessions {
        if max_sessions == 0 {
            return Err("invalid max-sessions, expected positive integer".to_string());
        }
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err("invalid workers, expected positive integer".to_string());
        }
    }
    if let Some(concurrency) = args.probe_concurrency {
        if concurrency == 0 {
            return Err("invalid probe-concurrency, expected positive integer".to_string());
        }
    }
    for (flag, value) in [
        ("probe-timeout", args.probe_timeout),
        ("enumerate-timeout", args.enumerate_timeout),
        ("crawl-timeout", args.crawl_timeout),
        ("scan-timeout", args.scan_timeout),
    ] {
        if value == Some(0) {
            return Err(format!("invalid {flag}, expected positive number of seconds"));
        }
    }
    if let Some(raw) = args.alive_status.as_deref() {
        crate::utils::parse_u16_set_csv(raw)
            .map_err(|e| format!("invalid --alive-status '{raw}': {e}"))?;
    }
    if let Some(raw) = args.probe_backend.as_deref() {
        crate::runner::ProbeBackend::parse(raw)?;
    }
    for raw in args.domain.iter() {
        crate::utils::normalize_domain(raw).map_err(|e| format!("invalid --domain: {e}"))?;
    }
    if args.json && args.events.is_some() {
        return Err("use either --json or --events, not both".to_string());
    }
    Ok(())
}
