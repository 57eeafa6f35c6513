//! HTTP surface for the Runway run engine
//!
//! Thin axum layer over [`runway_engine::Runtime`]: run admission, SSE event
//! streaming, snapshot reads, and approval recording.

pub mod app;
pub mod runs;

pub use app::{build_router, AppState};
