// Declare all modules as public so they can be used by the binary and tests.
pub mod cache;
pub mod config;
pub mod context;
pub mod core;
pub mod locks;
pub mod memory;
pub mod tasks;
pub mod utils;
