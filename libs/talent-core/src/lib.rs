//! Code-execution and job-processing pipeline for candidate assessments.
//!
//! - [`engine`] runs one untrusted program in a throwaway Docker container
//! - [`evaluator`] grades a submission across its test cases
//! - [`queue`] is the broker-backed job queue with retry and in-process fallback
//! - [`cache`] is the best-effort read-through cache
//! - [`controllers`] adapt HTTP-facing calls onto the queue

pub mod cache;
pub mod controllers;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod exam;
pub mod metrics;
pub mod problems;
pub mod processors;
pub mod queue;
