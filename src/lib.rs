//! OTP relay - email retrieval with per-tenant access control
//!
//! Reads one shared mailbox over IMAP and hands each tenant only the
//! one-time-code messages its grant covers.
//!
//! ## Module Organization
//!
//! - `adapters/`: IMAP session and SQLite pattern store
//! - `services/`: fetch pipeline and the retrieval façade
//! - `types/`: data structures and the error type
//! - `config/`: configuration loading

pub mod adapters;
pub mod config;
pub mod services;
pub mod types;
