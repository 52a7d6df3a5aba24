//! Service job scheduling.
//!
//! Client jobs may depend on long-running service jobs being up before they
//! run. The [`ServiceManager`] launches those services and watches their
//! lifecycle through job store markers, without sharing memory with the
//! worker processes that host them.
//!
//! # Marker protocol
//!
//! | Marker | Removed by | Meaning of removal |
//! |---|---|---|
//! | start | worker | the service is up (or failed, see below) |
//! | terminate | leader | the service should stop |
//! | error | worker or crash cleanup | the service failed |
//!
//! A service whose start and error markers are both gone when first
//! observed is treated as having failed before it could be used.
//!
//! # Batches
//!
//! Clients with a single batch are tracked in one pass by the coordination
//! loop. Clients with several ordered batches are started one batch at a time,
//! blocking the loop until each batch is up.

pub mod manager;
mod starter;
pub mod throttle;

pub use manager::ServiceManager;
pub use throttle::LogThrottle;
