use serde::Serialize;

/// Lifecycle of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Created,
    Connected,
    Polling,
    Dispatching,
    Committing,
    Cancelling,
    Stopped,
}

impl ConsumerState {
    /// Whether a broker session is expected to be live
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ConsumerState::Connected
                | ConsumerState::Polling
                | ConsumerState::Dispatching
                | ConsumerState::Committing
        )
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Connected => "connected",
            ConsumerState::Polling => "polling",
            ConsumerState::Dispatching => "dispatching",
            ConsumerState::Committing => "committing",
            ConsumerState::Cancelling => "cancelling",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
