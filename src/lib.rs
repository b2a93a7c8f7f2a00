//! Session anomaly detection and per-user trust scoring.
//!
//! Session events go through [`detection::Engine::evaluate`], which runs the
//! enabled rules, persists alerts and lowers the offending user's trust
//! score. [`api::DetectionApi`] exposes the read and admin side.

pub mod api;
pub mod config;
pub mod core;
pub mod detection;
pub mod notifications;
pub mod store;
