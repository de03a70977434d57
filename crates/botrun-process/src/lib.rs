/// Phase of a single run invocation.
///
/// `Failed` is transient: the engine publishes it on a fatal classification and
/// then settles back to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Failed,
}

impl RunPhase {
    pub fn is_running(self) -> bool {
        matches!(self, RunPhase::Running)
    }
}

/// Output-classified failure that aborts the whole run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FatalError {
    #[error("the bot client is out of date; update the installed client and try again")]
    ClientOutOfDate,
    #[error("web walking data is missing; launch the client manually to download it")]
    MissingWalkData,
    #[error("invalid username or password for the configured account")]
    InvalidCredentials,
}

impl FatalError {
    pub fn code(self) -> &'static str {
        match self {
            FatalError::ClientOutOfDate => "client_out_of_date",
            FatalError::MissingWalkData => "missing_walk_data",
            FatalError::InvalidCredentials => "invalid_credentials",
        }
    }
}

/// Notification published by the run engine to observers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A script command was spawned. `index` is its position in the run.
    Started { index: usize, os_pid: Option<u32> },
    /// The client process id was resolved by diffing process snapshots.
    PidResolved { index: usize, pid: u32 },
    /// A script command finished (stream closed or exit marker seen).
    Finished { index: usize },
    /// The spawn or stream read for a command failed.
    CommandFailed { index: usize, message: String },
    Fatal { error: FatalError },
    /// The run task is done; no more events follow for this run.
    RunCompleted,
}
