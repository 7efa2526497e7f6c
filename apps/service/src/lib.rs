//! Vigil: periodic HTTP and TLS checks with batched result storage and
//! failure notifications.

pub mod checks;
pub mod config;
pub mod database;
pub mod engine;
pub mod notify;
pub mod pool;
pub mod service;
