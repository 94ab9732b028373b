//! ramlet-core: Core types for the ramlet scheduler
//!
//! This crate provides the fundamental types used throughout the ramlet system:
//! - Requests, reservations and the messages exchanged between processes
//! - Job specifications and thread plans
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod ids;
pub mod model;

pub use config::*;
pub use error::*;
pub use ids::*;
pub use model::*;
