//! File repository for circuit breaker state persistence.

use std::path::{Path, PathBuf};

use tracing::debug;
use trading_core::persistence::{read_json, write_json_atomic};
use trading_core::Result;

use crate::circuit_breaker::CircuitBreakerState;

/// Repository for circuit breaker state persistence.
///
/// The whole state is written on every mutation so that trip status and
/// half-open timers survive a restart.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    /// Create a new repository.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state from disk.
    pub fn load(&self) -> Result<Option<CircuitBreakerState>> {
        let state: Option<CircuitBreakerState> = read_json(&self.path)?;

        if let Some(ref s) = state {
            debug!(
                path = %self.path.display(),
                state = ?s.state,
                trigger_type = ?s.trigger_type,
                total_losses = %s.total_losses,
                kill_switch_active = s.kill_switch_active,
                "Loaded circuit breaker state"
            );
        }

        Ok(state)
    }

    /// Save state to disk.
    pub fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        write_json_atomic(&self.path, state)?;
        debug!(state = ?state.state, "Saved circuit breaker state");
        Ok(())
    }
}
