pub mod api;
pub mod args;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod secret;
pub mod security;
pub mod state;
pub mod status_poller;
pub mod store;
pub mod supervisor;
