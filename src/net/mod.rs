//! Network fetch capability.
//!
//! - [`fetcher`]: the `Fetcher` seam and its reqwest-backed implementation

pub mod fetcher;
