//! Stackgate - boots a local data platform behind a supervised reverse proxy
//!
//! This library provides the pieces of a small local deployment:
//! - Runs external commands and captures their output
//! - Supervises the lifecycle of a backend data platform driven by its CLI
//!   (absent, starting, running), with bounded polling and timeouts
//! - Parses the platform's status output into endpoint and credential records
//! - Builds a subdomain route table from the discovered endpoints
//! - Renders the table into a reverse-proxy config and supervises the proxy process

pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod proxy;
pub mod routes;
pub mod status;
