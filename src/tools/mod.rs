//! Typed tool catalog and its thin HTTP dispatch surface
//!
//! Transport stays deliberately minimal: every tool is one POST route
//! taking a typed JSON request and returning a typed JSON response (or the
//! typed error shape from [`crate::error::DaemonError`]).

mod router;
pub mod types;

pub use router::{build_router, AppState};
