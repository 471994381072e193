//! # Upstream supervisor
//!
//! One actor per configured server, each owning its transport, connection
//! state machine and tool list. The supervisor holds the only
//! name-to-actor map in the process, routes tool calls, applies
//! smart-merge patches and feeds the health calculator.

pub mod actor;
pub mod error;
pub mod mask;
pub mod process;
pub mod state;
pub mod supervisor;

pub use actor::{ActorCommand, ActorDeps, ActorHandle, ActorStatus};
pub use error::{SupervisorError, SupervisorResult};
pub use mask::{mask_pair, mask_value};
pub use state::{can_transition, next_state, ConnectionState, RetryPolicy, StateEvent};
pub use supervisor::{ServerView, Supervisor};
