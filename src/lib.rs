//! Supervised execution of coding-agent work plans.
//!
//! foreman launches a coding agent as a subprocess, parses its structured
//! output stream, brokers tool permissions over a Unix socket, relays
//! output and prompts through a nested-process tunnel, multiplexes
//! follow-up input, and retries attempts that only produced a plan.

pub mod agent;
pub mod cli;
pub mod config;
pub mod executor;
pub mod failure;
pub mod fingerprint;
pub mod input;
pub mod log;
pub mod monitor;
pub mod permission;
pub mod runner;
pub mod stream;
pub mod tunnel;
