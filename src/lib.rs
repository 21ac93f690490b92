pub mod agents;
pub mod assembler;
pub mod client;
pub mod constants;
pub mod db;
pub mod decoder;
pub mod emulation;
pub mod frames;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod model;
pub mod observers;
pub mod orchestrator;
pub mod reactor;
pub mod recorder;
pub mod str_utils;
pub mod types;
pub mod whitespace;

pub use types::*;

pub use main_helper::{AppState, Args};
