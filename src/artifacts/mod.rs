use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::OwnedMutexGuard;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Subdomains,
    Alive,
    Crawl,
    Parameters,
    Xss,
}

impl ArtifactKind {
    fn suffix(&self) -> &'static str {
        match self {
            ArtifactKind::Subdomains => "subdomains",
            ArtifactKind::Alive => "alive_curl",
            ArtifactKind::Crawl => "crawl",
            ArtifactKind::Parameters => "parameters",
            ArtifactKind::Xss => "xss",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Subdomains => "subdomains",
            ArtifactKind::Alive => "alive origins",
            ArtifactKind::Crawl => "crawl output",
            ArtifactKind::Parameters => "parameterized urls",
            ArtifactKind::Xss => "xss results",
        }
    }

    pub fn file_name(&self, domain: &str) -> String {
        format!("{domain}_{}.txt", self.suffix())
    }
}

// what events carry: the token is the bare file name inside the output
// directory, resolvable through ArtifactStore::resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid artifact token '{token}'")]
    InvalidToken { token: String },

    #[error("artifact not found: {token}")]
    NotFound { token: String },
}

type DomainLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    domain_locks: DomainLocks,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            domain_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> Result<(), ArtifactError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ArtifactError::CreateDir {
                path: self.root.display().to_string(),
                source: e,
            })
    }

    pub fn path(&self, domain: &str, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name(domain))
    }

    pub fn reference(&self, domain: &str, kind: ArtifactKind) -> ArtifactRef {
        ArtifactRef {
            kind,
            token: kind.file_name(domain),
        }
    }

    // artifact paths are keyed by domain, so two sessions for the same domain
    // must not overlap. the guard is held for the whole session.
    pub async fn lock_domain(&self, domain: &str) -> DomainGuard {
        let lock = {
            let mut locks = self
                .domain_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        DomainGuard {
            guard: Some(lock.lock_owned().await),
            domain: domain.to_string(),
            locks: self.domain_locks.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_domains(&self) -> usize {
        self.domain_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub async fn write_lines<I, S>(
        &self,
        domain: &str,
        kind: ArtifactKind,
        lines: I,
    ) -> Result<PathBuf, ArtifactError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut writer = self.create_writer(domain, kind).await?;
        for line in lines {
            writer.write_line(line.as_ref()).await?;
        }
        let (path, _) = writer.finish().await?;
        Ok(path)
    }

    // Ok(None) when the artifact was never written.
    pub async fn read_lines(
        &self,
        domain: &str,
        kind: ArtifactKind,
    ) -> Result<Option<Vec<String>>, ArtifactError> {
        let path = self.path(domain, kind);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(
                contents
                    .lines()
                    .map(|l| l.trim())
                    .filter(|l| !l.is_empty())
                    .map(|l| l.to_string())
                    .collect(),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArtifactError::Read {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    pub async fn create_writer(
        &self,
        domain: &str,
        kind: ArtifactKind,
    ) -> Result<ArtifactWriter, ArtifactError> {
        let path = self.path(domain, kind);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| ArtifactError::Write {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(ArtifactWriter {
            path,
            file: BufWriter::new(file),
            lines: 0,
        })
    }

    pub async fn resolve(&self, token: &str) -> Result<PathBuf, ArtifactError> {
        let invalid = || ArtifactError::InvalidToken {
            token: token.to_string(),
        };
        if token.is_empty() || token.contains('/') || token.contains('\\') {
            return Err(invalid());
        }
        let mut components = Path::new(token).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(invalid()),
        }

        let not_found = || ArtifactError::NotFound {
            token: token.to_string(),
        };
        let candidate = tokio::fs::canonicalize(self.root.join(token))
            .await
            .map_err(|_| not_found())?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| not_found())?;
        if !candidate.starts_with(&root) {
            return Err(invalid());
        }
        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => Ok(candidate),
            _ => Err(not_found()),
        }
    }
}

// releases the per-domain lock and forgets the domain once nobody else holds
// or waits on it.
#[derive(Debug)]
pub struct DomainGuard {
    guard: Option<OwnedMutexGuard<()>>,
    domain: String,
    locks: DomainLocks,
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.domain)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.domain);
        }
    }
}

#[derive(Debug)]
pub struct ArtifactWriter {
    path: PathBuf,
    file: BufWriter<File>,
    lines: usize,
}

impl ArtifactWriter {
    pub async fn write_line(&mut self, line: &str) -> Result<(), ArtifactError> {
        let write = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.write_all(b"\n").await
        };
        write.await.map_err(|e| ArtifactError::Write {
            path: self.path.display().to_string(),
            source: e,
        })?;
        self.lines += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<(PathBuf, usize), ArtifactError> {
        self.file
            .flush()
            .await
            .map_err(|e| ArtifactError::Write {
                path: self.path.display().to_string(),
                source: e,
            })?;
        Ok((self.path, self.lines))
    }
}
