//! HTTP control plane.
//!
//! Re-exports the public API server types.

mod api;

pub use api::{ApiCommand, ApiServer};
