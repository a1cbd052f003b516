//! Library root for the `sentiment_loop` crate
//! Sentiment serving with a feedback-driven monitoring and retraining loop

// Core error handling
pub mod errors;

// Configuration & logging
pub mod config;
pub mod config_loader;
pub mod log_sink;

// Audit
pub mod audit;

// Feedback log
pub mod feedback_store;
pub mod feedback_store_sled;
pub mod records;

// Model pipeline & evaluation
pub mod benchmark;
pub mod evaluation;
pub mod pipeline;

// Monitoring & trigger
pub mod drift;
pub mod drift_snapshot;
pub mod monitoring;
pub mod trigger;

// Retraining, validation & registry
pub mod artifact_store;
pub mod model_version;
pub mod orchestrator;
pub mod registry;
pub mod retraining_job;
pub mod validator;

// Runtime & surfaces
pub mod app_state;
pub mod cli;
pub mod control_loop;
pub mod input_validator;
pub mod prediction;
pub mod privacy;
pub mod web;
