//! Connection state machine for one upstream
//!
//! Transitions form a DAG checked by [`can_transition`]; the five error
//! leaves are sticky and only `Shutdown` leaves them. The supervisor never
//! auto-promotes an error leaf to `failed`; error states persist until
//! user action.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    Launching,
    WaitingReady,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,

    // Sticky error leaves
    ErrorPortConflict,
    ErrorDbLocked,
    ErrorConfig,
    ErrorPermission,
    ErrorGeneral,
    Failed,
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Begin: stdio goes through launching, HTTP skips straight to
    /// connecting
    Start,
    SkipCore,
    CoreStarted,
    CoreReady,
    CoreExited,
    PortConflict,
    DbLocked,
    ConfigError,
    PermissionError,
    GeneralError,
    Timeout,
    Retry,
    RetriesExhausted,
    Connected,
    ConnectionLost,
    Shutdown,
}

impl ConnectionState {
    /// Whether this is one of the sticky error leaves
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ConnectionState::ErrorPortConflict
                | ConnectionState::ErrorDbLocked
                | ConnectionState::ErrorConfig
                | ConnectionState::ErrorPermission
                | ConnectionState::ErrorGeneral
                | ConnectionState::Failed
        )
    }

    /// Whether the state accepts no further events at all
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::ShuttingDown)
    }

    /// Human-readable label, used by health summaries and logs
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Launching => "launching",
            ConnectionState::WaitingReady => "waiting_ready",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::ErrorPortConflict => "error: port conflict",
            ConnectionState::ErrorDbLocked => "error: database locked",
            ConnectionState::ErrorConfig => "error: configuration",
            ConnectionState::ErrorPermission => "error: permission denied",
            ConnectionState::ErrorGeneral => "error: general",
            ConnectionState::Failed => "failed",
        }
    }

    /// States reachable from `self` (excluding self-loops)
    pub fn valid_transitions(&self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Initializing => &[Launching, Connecting, ShuttingDown],
            Launching => &[
                WaitingReady,
                ErrorPortConflict,
                ErrorDbLocked,
                ErrorConfig,
                ErrorPermission,
                ErrorGeneral,
                ShuttingDown,
            ],
            WaitingReady => &[Connecting, Launching, ErrorGeneral, ShuttingDown],
            Connecting => &[Connected, Reconnecting, ShuttingDown],
            Connected => &[Reconnecting, ShuttingDown],
            Reconnecting => &[Connected, Launching, Failed, ShuttingDown],
            // Error leaves accept only shutdown
            ErrorPortConflict | ErrorDbLocked | ErrorConfig | ErrorPermission | ErrorGeneral
            | Failed => &[ShuttingDown],
            ShuttingDown => &[],
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether `from -> to` is a legal edge of the DAG
pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    from.valid_transitions().contains(&to)
}

/// Compute the next state for `(state, event)`, or `None` when the event
/// does not apply in that state
pub fn next_state(state: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use StateEvent::*;

    // Shutdown wins everywhere, including the error leaves
    if event == Shutdown {
        return (!state.is_terminal()).then_some(ShuttingDown);
    }

    // Error leaves are sticky: nothing but shutdown moves them
    if state.is_error() {
        return None;
    }

    let next = match (state, event) {
        (Initializing, Start) => Launching,
        (Initializing, SkipCore) => Connecting,

        (Launching, CoreStarted) => WaitingReady,
        (Launching, PortConflict) => ErrorPortConflict,
        (Launching, DbLocked) => ErrorDbLocked,
        (Launching, ConfigError) => ErrorConfig,
        (Launching, PermissionError) => ErrorPermission,
        (Launching, GeneralError) | (Launching, Timeout) => ErrorGeneral,

        (WaitingReady, CoreReady) => Connecting,
        (WaitingReady, CoreExited) | (WaitingReady, Timeout) => ErrorGeneral,
        (WaitingReady, Retry) => Launching,

        (Connecting, StateEvent::Connected) => ConnectionState::Connected,
        (Connecting, ConnectionLost) | (Connecting, Timeout) => Reconnecting,

        (ConnectionState::Connected, ConnectionLost) => Reconnecting,

        (Reconnecting, StateEvent::Connected) => ConnectionState::Connected,
        (Reconnecting, CoreExited) => Launching,
        (Reconnecting, RetriesExhausted) => Failed,

        _ => return None,
    };

    debug_assert!(can_transition(state, next), "{:?} -> {:?}", state, next);
    Some(next)
}

/// Per-state retry budget and pacing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Budget for the given state. The `waiting_ready` timeout
    /// deliberately exceeds any downstream readiness timeout so the actor
    /// never races a child's own health monitor.
    pub fn for_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => Self {
                max_attempts: 5,
                delay: Duration::from_secs(3),
                timeout: Duration::from_secs(30),
            },
            ConnectionState::Reconnecting => Self {
                max_attempts: 10,
                delay: Duration::from_secs(5),
                timeout: Duration::from_secs(30),
            },
            ConnectionState::WaitingReady => Self {
                max_attempts: 2,
                delay: Duration::from_secs(2),
                timeout: Duration::from_secs(90),
            },
            ConnectionState::Launching => Self {
                max_attempts: 3,
                delay: Duration::from_secs(2),
                timeout: Duration::from_secs(30),
            },
            _ => Self {
                max_attempts: 1,
                delay: Duration::from_secs(1),
                timeout: Duration::from_secs(30),
            },
        }
    }
}

/// Map a stdio child's exit code onto the state machine event it implies
pub fn event_for_exit_code(code: i32) -> Option<StateEvent> {
    match code {
        0 => None,
        2 => Some(StateEvent::PortConflict),
        3 => Some(StateEvent::DbLocked),
        4 => Some(StateEvent::ConfigError),
        5 => Some(StateEvent::PermissionError),
        _ => Some(StateEvent::GeneralError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use StateEvent::*;

    const ALL_STATES: &[ConnectionState] = &[
        Initializing,
        Launching,
        WaitingReady,
        Connecting,
        ConnectionState::Connected,
        Reconnecting,
        ShuttingDown,
        ErrorPortConflict,
        ErrorDbLocked,
        ErrorConfig,
        ErrorPermission,
        ErrorGeneral,
        Failed,
    ];

    const ALL_EVENTS: &[StateEvent] = &[
        Start,
        SkipCore,
        CoreStarted,
        CoreReady,
        CoreExited,
        PortConflict,
        DbLocked,
        ConfigError,
        PermissionError,
        GeneralError,
        Timeout,
        Retry,
        RetriesExhausted,
        StateEvent::Connected,
        ConnectionLost,
        Shutdown,
    ];

    #[test]
    fn test_every_computed_transition_is_in_the_dag() {
        for &state in ALL_STATES {
            for &event in ALL_EVENTS {
                if let Some(next) = next_state(state, event) {
                    assert!(
                        can_transition(state, next),
                        "{:?} --{:?}--> {:?} not in valid_transitions",
                        state,
                        event,
                        next
                    );
                }
            }
        }
    }

    #[test]
    fn test_error_states_are_sticky() {
        let error_states = ALL_STATES.iter().filter(|s| s.is_error());
        for &state in error_states {
            for &event in ALL_EVENTS {
                match next_state(state, event) {
                    Some(next) if event == Shutdown => assert_eq!(next, ShuttingDown),
                    Some(next) => panic!("{:?} left error state {:?} via {:?}", next, state, event),
                    None => {}
                }
            }
        }
    }

    #[test]
    fn test_shutdown_from_everywhere_but_terminal() {
        for &state in ALL_STATES {
            let next = next_state(state, Shutdown);
            if state == ShuttingDown {
                assert_eq!(next, None);
            } else {
                assert_eq!(next, Some(ShuttingDown));
            }
        }
    }

    #[test]
    fn test_launch_error_mapping() {
        assert_eq!(next_state(Launching, PortConflict), Some(ErrorPortConflict));
        assert_eq!(next_state(Launching, DbLocked), Some(ErrorDbLocked));
        assert_eq!(next_state(Launching, ConfigError), Some(ErrorConfig));
        assert_eq!(next_state(Launching, PermissionError), Some(ErrorPermission));
        assert_eq!(next_state(Launching, GeneralError), Some(ErrorGeneral));
        assert_eq!(next_state(Launching, Timeout), Some(ErrorGeneral));
    }

    #[test]
    fn test_happy_paths() {
        // stdio
        let mut state = Initializing;
        for event in [Start, CoreStarted, CoreReady, StateEvent::Connected] {
            state = next_state(state, event).unwrap();
        }
        assert_eq!(state, ConnectionState::Connected);

        // http
        let mut state = Initializing;
        for event in [SkipCore, StateEvent::Connected] {
            state = next_state(state, event).unwrap();
        }
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn test_reconnect_cycle() {
        let state = next_state(ConnectionState::Connected, ConnectionLost).unwrap();
        assert_eq!(state, Reconnecting);
        assert_eq!(next_state(state, StateEvent::Connected), Some(ConnectionState::Connected));
        assert_eq!(next_state(state, CoreExited), Some(Launching));
        assert_eq!(next_state(state, RetriesExhausted), Some(Failed));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(event_for_exit_code(0), None);
        assert_eq!(event_for_exit_code(2), Some(PortConflict));
        assert_eq!(event_for_exit_code(3), Some(DbLocked));
        assert_eq!(event_for_exit_code(4), Some(ConfigError));
        assert_eq!(event_for_exit_code(5), Some(PermissionError));
        assert_eq!(event_for_exit_code(1), Some(GeneralError));
        assert_eq!(event_for_exit_code(137), Some(GeneralError));
    }

    #[test]
    fn test_waiting_ready_timeout_exceeds_downstream() {
        let policy = RetryPolicy::for_state(WaitingReady);
        assert!(policy.timeout > Duration::from_secs(60));
    }

    #[test]
    fn test_retry_budgets_match_contract() {
        let connecting = RetryPolicy::for_state(Connecting);
        assert_eq!(connecting.max_attempts, 5);
        assert_eq!(connecting.delay, Duration::from_secs(3));

        let reconnecting = RetryPolicy::for_state(Reconnecting);
        assert_eq!(reconnecting.max_attempts, 10);
        assert_eq!(reconnecting.delay, Duration::from_secs(5));
    }
}
