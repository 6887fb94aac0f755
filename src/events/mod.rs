use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::artifacts::ArtifactRef;
use crate::probe::Liveness;
use crate::session::{SessionId, SessionState, Stage};

// everything a consumer needs is in the variant payload; nothing has to be
// parsed back out of display text.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    StageStarted {
        stage: Stage,
    },
    Status {
        stage: Stage,
        message: String,
    },
    Discovery {
        stage: Stage,
        item: String,
    },
    Probe {
        url: String,
        liveness: Liveness,
    },
    Progress {
        stage: Stage,
        done: usize,
        total: usize,
    },
    Error {
        stage: Stage,
        error: String,
    },
    StageSkipped {
        stage: Stage,
        reason: String,
    },
    ArtifactReady {
        stage: Stage,
        artifact: ArtifactRef,
    },
    SessionFinished {
        state: SessionState,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub session: SessionId,
    pub domain: String,
    #[serde(flatten)]
    pub event: EventKind,
}

// per-session handle on the event channel. a closed channel means nobody is
// listening anymore, which cancels the session.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
    session: SessionId,
    domain: String,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(
        tx: mpsc::Sender<ProgressEvent>,
        session: SessionId,
        domain: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            session,
            domain: domain.to_string(),
            cancel,
        }
    }

    fn wrap(&self, event: EventKind) -> ProgressEvent {
        ProgressEvent {
            session: self.session,
            domain: self.domain.clone(),
            event,
        }
    }

    fn consumer_gone(&self) {
        if !self.cancel.is_cancelled() {
            warn!(session = %self.session, domain = %self.domain, "event consumer went away, cancelling session");
            self.cancel.cancel();
        }
    }

    pub async fn emit(&self, event: EventKind) {
        if self.tx.send(self.wrap(event)).await.is_err() {
            self.consumer_gone();
        }
    }

    // waits for room in the channel without picking the event yet. None once
    // the consumer is gone.
    pub async fn reserve(&self) -> Option<mpsc::Permit<'_, ProgressEvent>> {
        match self.tx.reserve().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                self.consumer_gone();
                None
            }
        }
    }

    pub fn send_reserved(&self, permit: mpsc::Permit<'_, ProgressEvent>, event: EventKind) {
        permit.send(self.wrap(event));
    }

    pub async fn status(&self, stage: Stage, message: impl Into<String>) {
        self.emit(EventKind::Status {
            stage,
            message: message.into(),
        })
        .await
    }

    pub async fn discovery(&self, stage: Stage, item: impl Into<String>) {
        self.emit(EventKind::Discovery {
            stage,
            item: item.into(),
        })
        .await
    }

    pub async fn error(&self, stage: Stage, error: impl Into<String>) {
        self.emit(EventKind::Error {
            stage,
            error: error.into(),
        })
        .await
    }

    pub async fn skipped(&self, stage: Stage, reason: impl Into<String>) {
        self.emit(EventKind::StageSkipped {
            stage,
            reason: reason.into(),
        })
        .await
    }

    pub async fn artifact(&self, stage: Stage, artifact: ArtifactRef) {
        self.emit(EventKind::ArtifactReady { stage, artifact }).await
    }
}
