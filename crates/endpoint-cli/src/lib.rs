//! Endpoint CLI
//!
//! Command-line front end for the endpoint messaging layer: a loopback
//! demonstration of the messenger lifecycle and configuration inspection.

pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
