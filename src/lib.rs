//! Public Transaction Engine: a nonce-ordered, gas-managed lifecycle for
//! outbound ledger transactions. One [`engine::Engine`] owns one
//! [`orchestrator::Orchestrator`] per signer; each Orchestrator advances its
//! admitted [`ift::Ift`]s through nonce assignment, signing, submission and
//! confirmation tracking, auto-fueling itself via [`balance_manager`] and
//! pricing retries via [`gas_oracle`].
pub mod balance_manager;
pub mod config;
pub mod engine;
pub mod error;
pub mod gas_oracle;
pub mod ift;
pub mod interfaces;
pub mod orchestrator;
pub mod types;
pub mod utils;

pub use config::{load_config, Config};
pub use engine::Engine;
pub use error::EngineError;
