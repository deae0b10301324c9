pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod holds;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod tools;
pub mod wal;
pub mod wire;
