//! SegVault Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, checksum helpers and
//! configuration structures used across all SegVault components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Crc32c, compute_crc32c, verify_crc32c};
pub use config::BackupConfig;
pub use error::{Error, Result};
pub use types::*;
