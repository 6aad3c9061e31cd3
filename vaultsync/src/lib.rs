//! vaultsync library
//!
//! Per-user data engine for multi-device note sync: isolated databases per
//! user, serialized writes, filesystem content storage, note history and
//! full-text search.

pub mod app;
pub mod config;
pub mod database;
pub mod error;
pub mod search;
pub mod serializer;
pub mod services;
pub mod storage;
pub mod versioning;
