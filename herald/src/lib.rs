//! Configuration and process wiring for the `herald` daemon and `heraldctl`.

pub mod config;
pub mod controller;

pub use controller::{Herald, SHUTDOWN_BROADCAST, Services};
