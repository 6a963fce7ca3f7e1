//! Durable task store for mule.
//!
//! Owns the PostgreSQL schema, row models, and every query the queue core
//! issues. All status mutations go through compare-and-swap updates so
//! concurrent coordinator loops cannot lose writes silently.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
