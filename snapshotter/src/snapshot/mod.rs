// Process snapshot registry: capture a running program, terminate it, and
// later relaunch it into the same registry slot.

pub mod capture;
pub mod config;
pub mod control;
pub mod daemon_client;
pub mod procinfo;
pub mod process_control;
pub mod protocol;
pub mod registry;
pub mod restore;
pub mod saved;
pub mod terminal;
