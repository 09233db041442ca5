//! Lifecycle transition table.
//!
//! `decide` is total over (state, trigger): every pair maps to an explicit
//! outcome, so no operation can leave a record in an undefined state. The
//! caller owns the record and applies the outcome; this module never mutates.

use crate::{AppState, ResumeTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Launch,
    Activate,
    Terminate,
    Pause,
    Resume(ResumeTarget),
    Connected,
    Disconnected,
    ProcessStarted,
    ProcessExited,
    ProcessError,
    SpawnFailed,
    WatchdogDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Move to the given state and emit a notification.
    Transition(AppState),
    /// Treat the call as `activate`.
    RedirectActivate,
    /// Treat the call as `launch`.
    RedirectLaunch,
    /// Treat the call as `resume`.
    RedirectResume,
    /// Ask the supervisor to stop the live process.
    StopProcess,
    /// No process handle yet; stop as soon as the process reports started.
    DeferStop,
    /// Expected no-op, logged at info.
    Ignore(&'static str),
    /// Call made from the wrong source state, logged as a warning.
    Reject(&'static str),
}

pub fn decide(state: AppState, trigger: Trigger) -> Outcome {
    use AppState::*;
    use Outcome::*;

    match trigger {
        Trigger::Launch => match state {
            Stopped | Crashed | Error => Transition(Launching),
            Running | Active => RedirectActivate,
            Paused => RedirectResume,
            Launching => Ignore("launch already in progress"),
        },
        Trigger::Activate => match state {
            Stopped | Crashed | Error => RedirectLaunch,
            Running => Transition(Active),
            Active => Ignore("already active"),
            Paused => RedirectResume,
            Launching => Ignore("launch in progress; activates on connect"),
        },
        Trigger::Terminate => match state {
            Stopped => Ignore("already stopped"),
            Crashed | Error => Transition(Stopped),
            Launching => DeferStop,
            Running | Active | Paused => StopProcess,
        },
        Trigger::Pause => match state {
            Active => Transition(Paused),
            _ => Reject("not active"),
        },
        Trigger::Resume(target) => match state {
            Paused => Transition(target.state()),
            _ => Reject("not paused"),
        },
        Trigger::Connected => match state {
            Launching | Running => Transition(Active),
            Active => Ignore("already active"),
            Paused => Ignore("paused surface reconnected; staying paused"),
            Stopped | Crashed | Error => Reject("no live process for surface"),
        },
        Trigger::Disconnected => Ignore("disconnect does not change lifecycle state"),
        Trigger::ProcessStarted => match state {
            Launching => Transition(Running),
            Active => Ignore("surface connected before start was reported"),
            _ => Ignore("started event outside launch"),
        },
        Trigger::ProcessExited => match state {
            Stopped => Ignore("already stopped"),
            _ => Transition(Stopped),
        },
        Trigger::ProcessError => match state {
            Stopped | Error => Ignore("no live process"),
            _ => Transition(Error),
        },
        Trigger::SpawnFailed => match state {
            Launching => Transition(Stopped),
            _ => Ignore("spawn failure outside launch"),
        },
        Trigger::WatchdogDrift => match state {
            Launching | Running | Active | Paused => Transition(Crashed),
            _ => Ignore("no live process expected"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AppState::*;

    const TRIGGERS: [Trigger; 13] = [
        Trigger::Launch,
        Trigger::Activate,
        Trigger::Terminate,
        Trigger::Pause,
        Trigger::Resume(ResumeTarget::Active),
        Trigger::Resume(ResumeTarget::Running),
        Trigger::Connected,
        Trigger::Disconnected,
        Trigger::ProcessStarted,
        Trigger::ProcessExited,
        Trigger::ProcessError,
        Trigger::SpawnFailed,
        Trigger::WatchdogDrift,
    ];

    #[test]
    fn documented_transitions() {
        assert_eq!(
            decide(Stopped, Trigger::Launch),
            Outcome::Transition(Launching)
        );
        assert_eq!(
            decide(Launching, Trigger::ProcessStarted),
            Outcome::Transition(Running)
        );
        assert_eq!(
            decide(Running, Trigger::Connected),
            Outcome::Transition(Active)
        );
        assert_eq!(decide(Active, Trigger::Pause), Outcome::Transition(Paused));
        assert_eq!(
            decide(Paused, Trigger::Resume(ResumeTarget::Running)),
            Outcome::Transition(Running)
        );
        assert_eq!(decide(Active, Trigger::Terminate), Outcome::StopProcess);
        assert_eq!(
            decide(Paused, Trigger::ProcessExited),
            Outcome::Transition(Stopped)
        );
        assert_eq!(decide(Running, Trigger::Launch), Outcome::RedirectActivate);
        assert_eq!(decide(Stopped, Trigger::Activate), Outcome::RedirectLaunch);
    }

    #[test]
    fn pause_and_resume_from_wrong_state_are_rejected_not_errors() {
        for st in [Stopped, Launching, Running, Paused, Error, Crashed] {
            assert!(matches!(decide(st, Trigger::Pause), Outcome::Reject(_)));
        }
        for st in [Stopped, Launching, Running, Active, Error, Crashed] {
            assert!(matches!(
                decide(st, Trigger::Resume(ResumeTarget::Active)),
                Outcome::Reject(_)
            ));
        }
    }

    #[test]
    fn every_pair_has_an_outcome_and_transitions_stay_in_known_states() {
        for st in AppState::ALL {
            for trig in TRIGGERS {
                if let Outcome::Transition(next) = decide(st, trig) {
                    assert!(AppState::ALL.contains(&next));
                    assert_ne!(next, st, "{st:?} --{trig:?}--> self should be a no-op");
                }
            }
        }
    }

    #[test]
    fn launch_never_spawns_from_live_states() {
        for st in AppState::ALL.into_iter().filter(|s| s.is_live()) {
            assert_ne!(decide(st, Trigger::Launch), Outcome::Transition(Launching));
        }
    }

    #[test]
    fn only_launch_enters_launching() {
        for st in AppState::ALL {
            for trig in TRIGGERS {
                if decide(st, trig) == Outcome::Transition(Launching) {
                    assert_eq!(trig, Trigger::Launch);
                }
            }
        }
    }

    #[test]
    fn disconnect_never_changes_state() {
        for st in AppState::ALL {
            assert!(matches!(
                decide(st, Trigger::Disconnected),
                Outcome::Ignore(_)
            ));
        }
    }

    #[test]
    fn terminate_during_launch_is_deferred() {
        assert_eq!(decide(Launching, Trigger::Terminate), Outcome::DeferStop);
    }
}
