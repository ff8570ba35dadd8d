use serde::{Deserialize, Serialize};

/// Outcome an experiment body hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "signal", content = "reason", rename_all = "kebab-case")]
pub enum ControlSignal {
    /// The instance finished; move on to the next binding.
    #[default]
    Done,
    /// Re-run the same binding with the attempt counter incremented.
    Restart,
    /// Stop the whole run. The reason is reported with the binding.
    Abort(String),
}

impl ControlSignal {
    /// `Done` when `ok`, otherwise `Restart`.
    pub fn restart_unless(ok: bool) -> Self {
        if ok {
            ControlSignal::Done
        } else {
            ControlSignal::Restart
        }
    }
}

impl From<()> for ControlSignal {
    fn from(_: ()) -> Self {
        ControlSignal::Done
    }
}
