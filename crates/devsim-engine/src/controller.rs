//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Active device and telemetry mode state machine."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use devsim_common::Mode;
use devsim_sim::Device;

/// Effect of a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
}

impl ModeTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Entering backend mode refreshes the roster immediately.
    pub fn refreshes_roster(&self) -> bool {
        self.changed() && self.to == Mode::Backend
    }
}

/// Effect of reconciling the active device with a fresh roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Unchanged,
    /// The active device vanished and the first listed device took over.
    Switched(String),
    /// The active device vanished and the roster is empty.
    Cleared,
}

#[derive(Debug, Clone, Default)]
pub struct ModeController {
    mode: Mode,
    active_device: Option<String>,
}

impl ModeController {
    pub fn new(mode: Mode, active_device: Option<String>) -> Self {
        Self {
            mode,
            active_device,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn active_device(&self) -> Option<&str> {
        self.active_device.as_deref()
    }

    /// Returns `true` when the active device actually changed.
    pub fn select_device(&mut self, device_id: Option<String>) -> bool {
        if self.active_device == device_id {
            return false;
        }
        self.active_device = device_id;
        true
    }

    pub fn set_mode(&mut self, mode: Mode) -> ModeTransition {
        let transition = ModeTransition {
            from: self.mode,
            to: mode,
        };
        self.mode = mode;
        transition
    }

    pub fn reconcile_roster(&mut self, roster: &[Device]) -> RosterChange {
        if let Some(active) = self.active_device.as_deref() {
            if roster.iter().any(|device| device.id == active) {
                return RosterChange::Unchanged;
            }
        }
        match roster.first() {
            Some(first) => {
                if self.active_device.as_deref() == Some(first.id.as_str()) {
                    return RosterChange::Unchanged;
                }
                self.active_device = Some(first.id.clone());
                RosterChange::Switched(first.id.clone())
            }
            None if self.active_device.is_some() => {
                self.active_device = None;
                RosterChange::Cleared
            }
            None => RosterChange::Unchanged,
        }
    }
}
