use std::collections::{BTreeSet, HashSet};
use std::fmt;

use reqwest::Url;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid URL '{url}': {reason}")]
    Invalid { url: String, reason: String },

    #[error("URL has no host: {url}")]
    MissingHost { url: String },
}

fn parse(url: &str) -> Result<Url, UrlError> {
    Url::parse(url.trim()).map_err(|e| UrlError::Invalid {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn host_of(url: &Url, raw: &str) -> Result<String, UrlError> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
        .ok_or_else(|| UrlError::MissingHost {
            url: raw.to_string(),
        })
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

// scheme + host (+ non-default port). always rendered with a single trailing
// slash and never carries a path or query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Origin {
    pub fn from_url(url: &Url) -> Result<Self, UrlError> {
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host_of(url, url.as_str())?,
            port: url.port(),
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/",
            self.scheme,
            authority(&self.host, self.port)
        )
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub fn normalize_origin(url: &str) -> Result<Origin, UrlError> {
    Origin::from_url(&parse(url)?)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterSignature {
    pub base: String,
    pub names: BTreeSet<String>,
}

impl ParameterSignature {
    pub fn of(url: &str) -> Result<Self, UrlError> {
        let parsed = parse(url)?;
        let host = host_of(&parsed, url)?;
        let base = format!(
            "{}://{}{}",
            parsed.scheme(),
            authority(&host, parsed.port()),
            parsed.path()
        );
        let names = parsed
            .query_pairs()
            .map(|(name, _)| name.into_owned())
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>();
        Ok(Self { base, names })
    }

    pub fn key(&self) -> String {
        if self.names.is_empty() {
            return self.base.clone();
        }
        let names = self.names.iter().map(|n| n.as_str()).collect::<Vec<_>>();
        format!("{}?{}", self.base, names.join("&"))
    }
}

// keeps the first url seen for every (base path, parameter names) shape,
// preserving input order. lines that do not parse as absolute urls are dropped.
pub fn dedup_by_parameter_shape<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        let url = url.as_ref().trim();
        if url.is_empty() {
            continue;
        }
        let signature = match ParameterSignature::of(url) {
            Ok(signature) => signature,
            Err(e) => {
                debug!("skipping crawl line: {e}");
                continue;
            }
        };
        if seen.insert(signature.key()) {
            out.push(url.to_string());
        }
    }
    out
}

pub fn has_query(url: &str) -> bool {
    Url::parse(url.trim())
        .ok()
        .and_then(|u| u.query().map(|q| !q.is_empty()))
        .unwrap_or(false)
}

pub fn filter_parameterized<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    urls.into_iter()
        .map(|u| u.as_ref().trim().to_string())
        .filter(|u| has_query(u))
        .collect()
}
