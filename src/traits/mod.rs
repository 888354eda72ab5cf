//! Trait definitions for swappable components
//!
//! Cache backends and scheduled jobs are defined here so that deployments can
//! provide their own implementations.

pub mod cache;
pub mod job;
