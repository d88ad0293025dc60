pub mod config;
pub mod exam;
pub mod job;
pub mod redis;
pub mod types;
