#[macro_use]
extern crate rocket;

pub mod api;
pub mod config;
pub mod divergence;
pub mod embedding;
pub mod emergency;
pub mod engine;
pub mod error;
pub mod outbox;
pub mod pattern;
pub mod seed;
pub mod sources;
pub mod telemetry;
pub mod truth;
pub mod vector;
