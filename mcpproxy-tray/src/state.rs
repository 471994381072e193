//! The tray's own state machine
//!
//! Mirrors the supervisor's shape: the tray launches the core, waits for
//! its API, connects, and reconnects on stream loss. The five error
//! leaves match the core's; all are sticky until shutdown or user action.

use std::time::Duration;

/// Tray lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayState {
    Initializing,
    LaunchingCore,
    WaitingForCore,
    ConnectingApi,
    Connected,
    Reconnecting,
    ShuttingDown,

    ErrorPortConflict,
    ErrorDbLocked,
    ErrorConfig,
    ErrorPermission,
    ErrorGeneral,
}

/// Events driving the tray state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayEvent {
    Start,
    CoreAlreadyRunning,
    CoreSpawned,
    CoreReady,
    CoreExited(i32),
    ApiConnected,
    StreamLost,
    RetriesExhausted,
    Shutdown,
}

impl TrayState {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TrayState::ErrorPortConflict
                | TrayState::ErrorDbLocked
                | TrayState::ErrorConfig
                | TrayState::ErrorPermission
                | TrayState::ErrorGeneral
        )
    }

    /// Retry budget per state
    pub fn retry_budget(&self) -> (u32, Duration) {
        match self {
            TrayState::WaitingForCore => (30, Duration::from_secs(2)),
            TrayState::ConnectingApi => (5, Duration::from_secs(3)),
            TrayState::Reconnecting => (0, Duration::from_secs(5)), // unlimited
            _ => (1, Duration::from_secs(1)),
        }
    }
}

/// Compute the next tray state, `None` when the event does not apply
pub fn tray_next_state(state: TrayState, event: TrayEvent) -> Option<TrayState> {
    use TrayEvent::*;
    use TrayState::*;

    if event == Shutdown {
        return (state != ShuttingDown).then_some(ShuttingDown);
    }
    if state.is_error() {
        return None;
    }

    let next = match (state, event) {
        (Initializing, Start) => LaunchingCore,
        (Initializing, CoreAlreadyRunning) => ConnectingApi,

        (LaunchingCore, CoreSpawned) => WaitingForCore,
        (LaunchingCore, CoreExited(code)) => error_for_exit(code),

        (WaitingForCore, CoreReady) => ConnectingApi,
        (WaitingForCore, CoreExited(code)) => error_for_exit(code),
        (WaitingForCore, RetriesExhausted) => ErrorGeneral,

        (ConnectingApi, ApiConnected) => Connected,
        (ConnectingApi, RetriesExhausted) => ErrorGeneral,
        (ConnectingApi, CoreExited(code)) => error_for_exit(code),

        (Connected, StreamLost) => Reconnecting,
        (Connected, CoreExited(_)) => Reconnecting,

        (Reconnecting, ApiConnected) => Connected,
        (Reconnecting, CoreExited(code)) => error_for_exit(code),

        _ => return None,
    };
    Some(next)
}

/// Exit codes 2-5 are the core's reserved startup failures
fn error_for_exit(code: i32) -> TrayState {
    match code {
        2 => TrayState::ErrorPortConflict,
        3 => TrayState::ErrorDbLocked,
        4 => TrayState::ErrorConfig,
        5 => TrayState::ErrorPermission,
        _ => TrayState::ErrorGeneral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrayEvent::*;
    use TrayState::*;

    #[test]
    fn test_cold_start_path() {
        let mut state = Initializing;
        for event in [Start, CoreSpawned, CoreReady, ApiConnected] {
            state = tray_next_state(state, event).unwrap();
        }
        assert_eq!(state, Connected);
    }

    #[test]
    fn test_warm_start_skips_launch() {
        let state = tray_next_state(Initializing, CoreAlreadyRunning).unwrap();
        assert_eq!(state, ConnectingApi);
    }

    #[test]
    fn test_core_exit_codes_map_to_leaves() {
        assert_eq!(
            tray_next_state(LaunchingCore, CoreExited(2)),
            Some(ErrorPortConflict)
        );
        assert_eq!(
            tray_next_state(WaitingForCore, CoreExited(3)),
            Some(ErrorDbLocked)
        );
        assert_eq!(
            tray_next_state(ConnectingApi, CoreExited(4)),
            Some(ErrorConfig)
        );
        assert_eq!(
            tray_next_state(LaunchingCore, CoreExited(5)),
            Some(ErrorPermission)
        );
        assert_eq!(
            tray_next_state(LaunchingCore, CoreExited(1)),
            Some(ErrorGeneral)
        );
    }

    #[test]
    fn test_reconnect_cycle() {
        let state = tray_next_state(Connected, StreamLost).unwrap();
        assert_eq!(state, Reconnecting);
        assert_eq!(tray_next_state(state, ApiConnected), Some(Connected));
    }

    #[test]
    fn test_error_leaves_sticky() {
        for state in [
            ErrorPortConflict,
            ErrorDbLocked,
            ErrorConfig,
            ErrorPermission,
            ErrorGeneral,
        ] {
            assert_eq!(tray_next_state(state, ApiConnected), None);
            assert_eq!(tray_next_state(state, Start), None);
            assert_eq!(tray_next_state(state, Shutdown), Some(ShuttingDown));
        }
    }
}
