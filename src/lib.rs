//! Vigil - Admission Control and Scheduled Broadcast
//!
//! This crate implements the two reliability components of a chronic-disease
//! monitoring backend: a per-client token-bucket limiter guarding the admin
//! HTTP API, and a dispatcher that sends scheduled reminders to every active
//! bot user while isolating per-recipient failures.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod schedule;
