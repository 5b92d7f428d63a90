//! Admin HTTP API for the Cose Vintage catalog.

pub mod auth;
pub mod models;
pub mod server;
pub mod telemetry;
