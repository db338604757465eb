//! printfleet: telemetry and print dispatch for a mixed Prusa / Bambu Lab printer fleet.

pub mod bambu;
pub mod config;
pub mod dispatch;
pub mod exposition;
pub mod metrics;
pub mod print_job;
pub mod prusa;
pub mod web;

pub use printfleet_shared as shared;
