//! offline-tier: offline-capable request interception.
//!
//! Serves a web application's requests from a tiered cache:
//!   static partition (pre-cached manifest) → runtime partition (FIFO-bounded) → network
//!
//! Each GET is classified by an ordered rule list and handled cache-first,
//! network-first or stale-while-revalidate. Partitions are versioned; a
//! version change supersedes them wholesale on activation.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod net;
pub mod router;
pub mod server;
pub mod worker;
