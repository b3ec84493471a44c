// Snapshot registry library
// Shared between the snapshotd daemon and the snapctl CLI

// Registry, capture and restore
pub mod snapshot;

// tracing subscriber setup for the binaries
pub mod logging;
