//! Engine state definitions.

/// Engine operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine is running and accepting new coordinations.
    Running,
    /// Engine is failing live coordinations and waking blocked callers.
    ShuttingDown,
    /// Engine is stopped.
    Stopped,
}

impl EngineState {
    /// Check if the engine is accepting new coordinations.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, EngineState::Running)
    }

    /// Check if the engine is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped)
    }
}
