//! HTTP front that runs the interception layer in front of a web application.
//!
//! - [`control_api`]: `/__offline/*` control routes and router assembly
//! - [`proxy`]: conversion between HTTP messages and intercepted requests

pub mod control_api;
pub mod proxy;
