//! Service health monitoring and alerting engine.
//!
//! Scheduled probes (HTTP, TCP, DNS, database) feed a status evaluator; every
//! result is recorded as history, and notification rules decide which
//! channels hear about failures, recoveries and expiring certificates.

pub mod catchers;
pub mod channels;
pub mod checker;
pub mod config;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod maintenance;
pub mod models;
pub mod notifications;
pub mod probe;
pub mod recorder;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod sse;

pub use error::{Error, Result};
pub use server::Engine;
