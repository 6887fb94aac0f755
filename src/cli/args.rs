use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "reconpipe",
    version,
    about = "recon pipeline orchestrator",
    long_about = "reconpipe chains subdomain enumeration, liveness probing, crawling and XSS scanning for each target domain, streaming progress as it goes.\n\nExamples:\n  reconpipe -d example.com\n  reconpipe -d example.com -d example.org -m 4 --output-dir ./recon\n  cat domains.txt | reconpipe --stdin --events events.jsonl\n\nTip: Use --init-config to write ~/.reconpipe/config.yml and keep tool paths there."
)]
pub struct CliArgs {
    #[arg(
        short = 'v',
        long = "vb",
        visible_alias = "verbose",
        action = ArgAction::Count,
        help_heading = "Output",
        help = "Increase diagnostic log verbosity (-v, -vv)."
    )]
    pub verbose: u8,

    #[arg(
        short = 'c',
        long = "clr",
        visible_alias = "color",
        help_heading = "Output",
        help = "Enable colored output (overrides --no-color)."
    )]
    pub color: bool,

    #[arg(
        short = 'n',
        long = "nc",
        visible_alias = "no-color",
        help_heading = "Output",
        help = "Disable colored output."
    )]
    pub no_color: bool,

    #[arg(
        short = 'j',
        long = "js",
        visible_alias = "json",
        help_heading = "Output",
        help = "Print events as JSON lines instead of colored text."
    )]
    pub json: bool,

    #[arg(
        short = 'e',
        long = "ev",
        visible_alias = "events",
        value_name = "FILE",
        help_heading = "Output",
        help = "Append every event as a JSON line to FILE."
    )]
    pub events: Option<String>,

    #[arg(
        short = 'o',
        long = "od",
        visible_alias = "output-dir",
        value_name = "DIR",
        help_heading = "Output",
        help = "Directory for artifacts (default ./output)."
    )]
    pub output_dir: Option<String>,

    #[arg(
        short = 'd',
        long = "d",
        visible_alias = "domain",
        value_name = "DOMAIN",
        action = ArgAction::Append,
        help_heading = "Input",
        help = "Target domain (repeatable)."
    )]
    pub domain: Vec<String>,

    #[arg(
        short = 'i',
        long = "if",
        visible_alias = "input-file",
        value_name = "FILE",
        help_heading = "Input",
        help = "Load target domains from a file (one per line)."
    )]
    pub input_file: Option<String>,

    #[arg(
        short = 's',
        long = "si",
        visible_alias = "stdin",
        help_heading = "Input",
        help = "Read target domains from stdin, starting a session per line as it arrives."
    )]
    pub stdin: bool,

    #[arg(
        short = 'C',
        long = "cfg",
        visible_alias = "config",
        value_name = "FILE",
        help_heading = "Input",
        help = "Path to config file (defaults to ~/.reconpipe/config.yml)."
    )]
    pub config: Option<String>,

    #[arg(
        long = "ic",
        visible_alias = "init-config",
        help_heading = "Input",
        help = "Write a default config file and exit."
    )]
    pub init_config: bool,

    #[arg(
        short = 'm',
        long = "ms",
        visible_alias = "max-sessions",
        value_name = "N",
        help_heading = "Performance",
        help = "Maximum number of domains processed at the same time."
    )]
    pub max_sessions: Option<usize>,

    #[arg(
        short = 'w',
        long = "wrk",
        visible_alias = "workers",
        value_name = "N",
        help_heading = "Performance",
        help = "Runtime worker threads."
    )]
    pub workers: Option<usize>,

    #[arg(
        short = 'r',
        long = "rt",
        visible_alias = "rate",
        value_name = "RPS",
        help_heading = "Performance",
        help = "Probe rate limit per session (requests per second, 0 = unlimited)."
    )]
    pub rate: Option<u32>,

    #[arg(
        short = 't',
        long = "pc",
        visible_alias = "probe-concurrency",
        value_name = "N",
        help_heading = "Probe",
        help = "Concurrent liveness probes per session."
    )]
    pub probe_concurrency: Option<usize>,

    #[arg(
        long = "pto",
        visible_alias = "probe-timeout",
        value_name = "SECONDS",
        help_heading = "Probe",
        help = "Timeout for a single liveness probe."
    )]
    pub probe_timeout: Option<u64>,

    #[arg(
        short = 'b',
        long = "pb",
        visible_alias = "probe-backend",
        value_name = "BACKEND",
        help_heading = "Probe",
        help = "Liveness backend (http or curl)."
    )]
    pub probe_backend: Option<String>,

    #[arg(
        short = 'a',
        long = "as",
        visible_alias = "alive-status",
        value_name = "CODES",
        help_heading = "Probe",
        help = "Status codes that mark an origin alive (comma-separated)."
    )]
    pub alive_status: Option<String>,

    #[arg(
        short = 'p',
        long = "px",
        visible_alias = "proxy",
        value_name = "URL",
        help_heading = "Probe",
        help = "HTTP proxy for the built-in prober."
    )]
    pub proxy: Option<String>,

    #[arg(
        long = "eto",
        visible_alias = "enumerate-timeout",
        value_name = "SECONDS",
        help_heading = "Tools",
        help = "Timeout for subdomain enumeration."
    )]
    pub enumerate_timeout: Option<u64>,

    #[arg(
        long = "cto",
        visible_alias = "crawl-timeout",
        value_name = "SECONDS",
        help_heading = "Tools",
        help = "Timeout for the crawler."
    )]
    pub crawl_timeout: Option<u64>,

    #[arg(
        long = "sto",
        visible_alias = "scan-timeout",
        value_name = "SECONDS",
        help_heading = "Tools",
        help = "Timeout for the XSS scanner."
    )]
    pub scan_timeout: Option<u64>,
}
