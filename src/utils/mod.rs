use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

static HOSTNAME_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn hostname_regex() -> Option<&'static Regex> {
    HOSTNAME_RE
        .get_or_init(|| {
            Regex::new(
                r"^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9])?\.)*[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$",
            )
            .ok()
        })
        .as_ref()
}

pub fn is_valid_hostname(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    hostname_regex().is_some_and(|re| re.is_match(value))
}

pub fn normalize_domain(value: &str) -> Result<String, String> {
    let cleaned = value.trim().trim_end_matches('.').to_ascii_lowercase();
    if cleaned.is_empty() {
        return Err("domain is empty".to_string());
    }
    if cleaned.contains("://") || cleaned.contains('/') {
        return Err(format!("'{}' looks like a url, expected a bare domain", value.trim()));
    }
    if !is_valid_hostname(&cleaned) {
        return Err(format!("invalid domain '{}'", value.trim()));
    }
    Ok(cleaned)
}

pub fn parse_u16_set_csv(value: &str) -> Result<HashSet<u16>, String> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err("list is empty".to_string());
    }
    let mut out = HashSet::new();
    for part in raw.split(',') {
        let item = part.trim();
        if item.is_empty() {
            continue;
        }
        let code: u16 = item
            .parse()
            .map_err(|_| format!("invalid status code '{item}'"))?;
        out.insert(code);
    }
    if out.is_empty() {
        return Err("list is empty".to_string());
    }
    Ok(out)
}
