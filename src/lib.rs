//! Firmware update orchestration core for the device management console.
//!
//! Coordinates the asynchronous, multi-stage update flow (encrypted package
//! upload, server-side disk-write and decryption monitoring, update
//! activation and run monitoring) entirely by polling short-lived progress
//! snapshots, folding them into one monotonic console timeline and a small
//! action-availability state machine.

pub mod config;
pub mod controller;
pub mod http_client;
pub mod poller;
pub mod state;
pub mod timeline;
pub mod update_run;
pub mod update_service_client;
pub mod upload;
