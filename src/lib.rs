//! Image Job Worker
//!
//! Background worker for the image tools platform: pulls transformation jobs
//! from tiered Redis queues, runs them against S3-compatible object storage
//! and a background-removal provider, and records status and deletion audit
//! for each job.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
