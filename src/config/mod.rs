use std::env;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::command::ToolSpec;

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ToolsConfig {
    #[serde(alias = "subfinder")]
    pub enumerator: Option<ToolSpec>,
    #[serde(alias = "katana")]
    pub crawler: Option<ToolSpec>,
    #[serde(alias = "dalfox")]
    pub scanner: Option<ToolSpec>,
    pub curl: Option<ToolSpec>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct ConfigFile {
    pub domains: Option<Vec<String>>,
    pub input_file: Option<String>,
    pub output_dir: Option<String>,
    pub max_sessions: Option<usize>,
    pub workers: Option<usize>,
    pub rate: Option<u32>,
    pub probe_concurrency: Option<usize>,
    pub probe_timeout: Option<u64>,
    pub probe_backend: Option<String>,
    #[serde(alias = "alive_statuses")]
    pub alive_status: Option<String>,
    pub proxy: Option<String>,
    pub enumerate_timeout: Option<u64>,
    pub crawl_timeout: Option<u64>,
    pub scan_timeout: Option<u64>,
    pub events: Option<String>,
    pub json: Option<bool>,
    pub no_color: Option<bool>,
    pub tools: Option<ToolsConfig>,
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
        .or_else(|| {
            let drive = env::var_os("HOMEDRIVE")?;
            let path = env::var_os("HOMEPATH")?;
            Some(PathBuf::from(drive).join(path))
        })
}

pub fn default_config_path() -> Option<PathBuf> {
    Some(home_dir()?.join(".reconpipe").join("config.yml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn expand_tilde_string(path: &str) -> String {
    expand_tilde(path).to_string_lossy().to_string()
}

pub fn parse_config(contents: &str) -> Result<ConfigFile, String> {
    serde_yaml::from_str::<ConfigFile>(contents).map_err(|e| e.to_string())
}

pub fn load_config(path: &PathBuf, allow_missing: bool) -> Result<ConfigFile, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents)
            .map_err(|e| format!("failed to parse config '{}': {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && allow_missing => {
            Ok(ConfigFile::default())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("config file not found '{}'", path.display()))
        }
        Err(e) => Err(format!("failed to read config '{}': {e}", path.display())),
    }
}

pub fn default_config_yaml() -> String {
    r#"# reconpipe config
#
# Location (default):
#   ~/.reconpipe/config.yml

# Targets (optional, CLI -d / -i / --stdin add more)
# domains:
#   - example.com
# input_file: ./domains.txt

# Artifacts
output_dir: ./output

# Sessions
max_sessions: 2
workers: 10

# Liveness probing
probe_backend: http
probe_timeout: 10
probe_concurrency: 10
rate: 0
alive_status: "200,301,302"
# proxy: http://127.0.0.1:8080

# Stage timeouts (seconds)
enumerate_timeout: 600
crawl_timeout: 1800
scan_timeout: 1800

# Events
# events: ./events.jsonl
json: false
no_color: false

# External tools. Placeholders: {domain}, {targets}, {url}, {timeout}
# tools:
#   enumerator:
#     program: subfinder
#     args: ["-d", "{domain}", "-silent"]
#   crawler:
#     program: katana
#     args: ["-list", "{targets}", "-silent"]
#   scanner:
#     program: dalfox
#     args: ["pipe"]
#   curl:
#     program: curl
#     args: ["--max-time", "{timeout}", "-L", "-o", "/dev/null", "-s", "-w", "%{http_code} %{url_effective}", "{url}"]
"#
    .to_string()
}

pub fn ensure_default_config_file(path: &PathBuf) -> Result<bool, String> {
    if path.exists() {
        return Ok(false);
    }
    let parent = path
        .parent()
        .ok_or_else(|| format!("invalid config path '{}'", path.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| {
        format!(
            "failed to create config directory '{}': {e}",
            parent.display()
        )
    })?;
    let contents = default_config_yaml();
    std::fs::write(path, contents)
        .map_err(|e| format!("failed to write config file '{}': {e}", path.display()))?;
    Ok(true)
}
