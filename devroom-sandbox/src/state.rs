//! Sandbox lifecycle states.
//!
//! ```text
//! Idle → Mounted → Installing → Running → Ready
//!                      ↑                    │
//!                      └──── run again ─────┘
//! ```
//!
//! `mount` is accepted from every state and lands in `Mounted`; teardown
//! from every state lands in `Idle`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    #[default]
    Idle,
    Mounted,
    Installing,
    Running,
    Ready,
}

impl SandboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Idle => "idle",
            SandboxState::Mounted => "mounted",
            SandboxState::Installing => "installing",
            SandboxState::Running => "running",
            SandboxState::Ready => "ready",
        }
    }

    /// States a `run` request is accepted from. Anything past `Mounted`
    /// is superseded by the new run.
    pub fn accepts_run(self) -> bool {
        !matches!(self, SandboxState::Idle)
    }

    pub fn allowed_transitions(self) -> &'static [SandboxState] {
        use SandboxState::*;
        match self {
            Idle => &[Mounted, Idle],
            Mounted => &[Mounted, Installing, Idle],
            Installing => &[Installing, Running, Mounted, Idle],
            Running => &[Ready, Installing, Mounted, Idle],
            Ready => &[Installing, Mounted, Idle],
        }
    }

    pub fn can_transition_to(self, to: SandboxState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxState::*;

    #[test]
    fn mount_and_teardown_are_always_allowed() {
        for from in [Idle, Mounted, Installing, Running, Ready] {
            assert!(from.can_transition_to(Mounted), "{from} -> mounted");
            assert!(from.can_transition_to(Idle), "{from} -> idle");
        }
    }

    #[test]
    fn happy_path_and_rerun_edge() {
        assert!(Mounted.can_transition_to(Installing));
        assert!(Installing.can_transition_to(Running));
        assert!(Running.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Installing));
    }

    #[test]
    fn cannot_skip_ahead() {
        assert!(!Idle.can_transition_to(Installing));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Mounted.can_transition_to(Ready));
        assert!(!Installing.can_transition_to(Ready));
        assert!(!Idle.accepts_run());
        assert!(Ready.accepts_run());
    }
}
