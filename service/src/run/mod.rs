//! Run orchestration module.
//!
//! - `startup`: opens storage and wires source, oracle and units
//! - `service`: the polling loop
//! - `commands`: cache-set administration subcommands
//! - `session`: terminal progress for backfills

mod commands;
mod service;
mod session;
mod startup;

pub use commands::{
    handle_backfill, handle_create_set, handle_deactivate_set, handle_ledger, handle_list_sets,
    handle_update_set,
};
pub use service::run_service;
pub use startup::ServiceContext;
