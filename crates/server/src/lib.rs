//! Dashboard server for the isync transfer engine.

pub mod api;
pub mod metrics;
pub mod state;
