//! Install/activate phases of one agent instance.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

/// Where the instance is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  /// Loaded but not installed
  #[default]
  Parsed,
  Installing,
  /// Shell staged, waiting for activation
  Installed,
  Activating,
  /// Reconciled and controlling requests
  Activated,
}

/// Phase plus the pending skip-waiting request.
#[derive(Debug, Default)]
pub struct Lifecycle {
  phase: Phase,
  skip_waiting: bool,
}

impl Lifecycle {
  pub fn new(skip_waiting: bool) -> Self {
    Self {
      phase: Phase::Parsed,
      skip_waiting,
    }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  /// Requests are only intercepted once activation finished.
  pub fn is_claimed(&self) -> bool {
    matches!(self.phase, Phase::Activated)
  }

  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting
  }

  /// Record a skip-waiting request. Returns true if activation can start right away.
  pub fn request_skip_waiting(&mut self) -> bool {
    self.skip_waiting = true;
    matches!(self.phase, Phase::Installed)
  }

  pub fn begin_install(&mut self) -> Result<()> {
    match self.phase {
      Phase::Parsed | Phase::Installed => {
        self.phase = Phase::Installing;
        Ok(())
      }
      other => Err(eyre!("Cannot install while {:?}", other)),
    }
  }

  pub fn begin_activate(&mut self) -> Result<()> {
    match self.phase {
      Phase::Installed => {
        self.phase = Phase::Activating;
        Ok(())
      }
      other => Err(eyre!("Cannot activate while {:?}", other)),
    }
  }

  /// Close the current transition. A failed transition returns to `Parsed`.
  pub fn finish(&mut self, ok: bool) {
    self.phase = match (self.phase, ok) {
      (Phase::Installing, true) => Phase::Installed,
      (Phase::Activating, true) => Phase::Activated,
      (Phase::Installing | Phase::Activating, false) => Phase::Parsed,
      (phase, _) => phase,
    };
  }
}
