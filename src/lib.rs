//! # sshhub
//!
//! A long-running SSH multiplexing service: a per-host connection pool with
//! request coalescing and idle reaping, a command executor wrapped in a
//! safety gate and a token-shaping output budget, a result cache, an
//! interactive shell session registry, and a chunked SFTP transfer engine —
//! all exposed over a line-delimited JSON stdio protocol.
//!
//! ## Main components
//!
//! - [`pool::ConnectionPool`] - bounded per-host Transport pool with
//!   first-connect coalescing and background reaping
//! - [`cache::ResultCache`] - two-tier TTL+LRU cache of recent command output
//! - [`safety`] - command classification (allowed / warn / blocked)
//! - [`shaping`] - deterministic, idempotent output budgeting
//! - [`executor::CommandExecutor`] - orchestrates the above for a single call
//! - [`interactive::SessionRegistry`] - long-lived interactive shells
//! - [`transfer::TransferEngine`] - chunked SFTP upload/download
//! - [`dispatcher::Dispatcher`] - the 14-tool external façade

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod interactive;
pub mod keystore;
pub mod model;
pub mod pool;
pub mod rpc;
pub mod safety;
pub mod shaping;
pub mod ssh;
pub mod transfer;
