use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::command::{describe_exit, CommandError, ProcessTable};
use crate::events::EventSink;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{source}")]
    ToolLaunch {
        #[source]
        source: CommandError,
    },

    #[error("{program} failed with {}: {stderr}", describe_exit(code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{source}")]
    Tool {
        #[source]
        source: CommandError,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl From<CommandError> for StageError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Launch { .. } => StageError::ToolLaunch { source: e },
            CommandError::Cancelled { .. } => StageError::Cancelled,
            other => StageError::Tool { source: other },
        }
    }
}

// what every stage needs from the session that runs it.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub domain: String,
    pub store: ArtifactStore,
    pub processes: ProcessTable,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

impl StageContext {
    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        Ok(())
    }
}
