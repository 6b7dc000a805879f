//! Offline core of the GeoPoint field app.
//!
//! Writes made without a connection are persisted in a durable local queue
//! and replayed in order by the sync engine once connectivity returns. A
//! separate cache gateway answers HTTP requests from versioned cache
//! generations so the app shell keeps loading offline.

pub mod app;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod event;
pub mod gateway;
pub mod queue;
pub mod remote;
pub mod session;
pub mod sync;
pub mod telemetry;
