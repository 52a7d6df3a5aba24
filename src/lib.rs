pub mod batch;
pub mod config;
pub mod error;
pub mod jobstore;
pub mod services;
pub mod shutdown;
pub mod workflow;
