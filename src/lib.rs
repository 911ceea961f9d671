#![allow(clippy::result_large_err)]

pub mod aas;
pub mod app;
pub mod backpressure;
pub mod config;
pub mod delegator;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod route;
pub mod telemetry;
pub mod transform;

pub mod transport;

pub mod context {
    pub use crate::route::context::*;
}
