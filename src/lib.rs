pub mod cleanup;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod output;
pub mod reconcile;
pub mod servicex;
pub mod store;
pub mod strategy;
pub mod transcode;
