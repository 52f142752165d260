//! Per-identity quota accounting.

mod config;
mod size;
mod tracker;

pub use config::QuotaConfig;
pub use size::{
    deserialize_size, format_size, parse_size, SizeParseError, GIB, KIB, MIB, PIB, TIB,
};
pub use tracker::{QuotaStatus, QuotaTracker};
