//! Local supervisor for dedicated game servers: launches and stops the server
//! process, polls its management API into a live model, restarts it when the
//! API goes dark, and edits the settings file the server reads on boot.

pub mod api;
pub mod api_client;
pub mod codec;
pub mod config;
pub mod error;
pub mod monitor;
pub mod palworld;
pub mod process;
pub mod state;
