// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod atom;
pub mod config;
pub mod platform;
pub mod services;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod vault;
