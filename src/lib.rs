//! # sipguard
//!
//! **Privacy tooling for a Parse-backed smart water bottle.**
//!
//! sipguard runs in one of two modes:
//!
//! - a MITM proxy that strips location and device identifiers from the app's
//!   requests before relaying them to the vendor API, optionally keeping the
//!   raw requests in a local log;
//! - a full replacement server that answers the app from a local SQLite
//!   database, so no data leaves the machine.
//!
//! ## Architecture
//!
//! - **[`redact`]**: rule-driven field removal and masking of JSON payloads
//! - **[`logging`]**: SQLite request log with JSON/CSV export
//! - **[`proxy`]**: MITM server and single-attempt upstream relay
//! - **[`server`]**: the replacement Parse API
//! - **[`config`]**: TOML configuration with environment substitution
//! - **[`cli`]**: command-line interface (clap)
//! - **[`error`]**: unified error types using `thiserror`
//!
//! ## Quick Start
//!
//! ```bash
//! sipguard init
//! # set mitm.upstream, then
//! sipguard mitm --log-requests
//!
//! # or run the replacement server
//! sipguard migrate
//! sipguard serve
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod redact;
pub mod server;
