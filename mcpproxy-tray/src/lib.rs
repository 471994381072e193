//! # Tray-side daemon
//!
//! A separate process that launches the core when needed, consumes the
//! core's SSE stream and maintains a smart-merged view model for the menu
//! renderer. The tray holds no authoritative state: every user command
//! round-trips through the core's REST API, and the view is rebuilt from
//! `GET /servers` on every `servers.changed`.

pub mod client;
pub mod model;
pub mod state;

pub use client::CoreClient;
pub use model::{ServerItem, ViewModel};
pub use state::{tray_next_state, TrayEvent, TrayState};
