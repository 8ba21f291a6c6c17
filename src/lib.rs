pub mod clients;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod mirror;
pub mod models;
pub mod portal;
pub mod registry;
pub mod state;
pub mod validation;
pub mod workers;

pub use workers::{default_handlers, Worker};
