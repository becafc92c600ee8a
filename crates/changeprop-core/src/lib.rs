pub mod config;
pub mod error;
pub mod http;
pub mod rule;
pub mod template;
pub mod types;
