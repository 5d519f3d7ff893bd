//! Configuration types for SegVault
//!
//! Configuration is read from a TOML file by the daemon; every field has a
//! default so a partial file (or none at all) still yields a usable
//! configuration for testing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for a backup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Cluster membership configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Frame storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// I/O and worker-pool configuration.
    #[serde(default)]
    pub io: IoConfig,
    /// Garbage collection configuration.
    #[serde(default)]
    pub gc: GcConfig,
}

/// Cluster identity configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of the cluster this backup belongs to.
    ///
    /// Persisted on storage; replicas written under a different cluster
    /// name are scrubbed at startup rather than reused.
    #[serde(default = "default_cluster_name")]
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
        }
    }
}

/// Which kind of frame store backs the replicas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single-file store on stable storage.
    File,
    /// In-memory store; replicas do not survive a restart.
    Memory,
}

/// Frame storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection.
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Path of the backing file (file backend only).
    #[serde(default = "default_file")]
    pub file: PathBuf,
    /// Capacity of one segment replica in bytes.
    #[serde(default = "default_segment_size")]
    pub segment_size: u32,
    /// Number of storage frames, each holding one replica.
    #[serde(default = "default_frame_count")]
    pub frame_count: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            file: default_file(),
            segment_size: default_segment_size(),
            frame_count: default_frame_count(),
        }
    }
}

/// I/O and worker-pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoConfig {
    /// Whether writes block until the frame is flushed to stable storage.
    #[serde(default = "default_sync")]
    pub sync: bool,
    /// Upper bound on concurrently running recovery-segment builds.
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            sync: default_sync(),
            max_concurrent_builds: default_max_concurrent_builds(),
        }
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Whether the GC tasks actually free replicas. When disabled the
    /// tasks drain themselves without touching storage.
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
        }
    }
}

fn default_cluster_name() -> String {
    "__unnamed__".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

fn default_file() -> PathBuf {
    PathBuf::from("/var/lib/segvault/frames")
}

fn default_segment_size() -> u32 {
    8 * 1024 * 1024
}

fn default_frame_count() -> u32 {
    512
}

fn default_sync() -> bool {
    true
}

fn default_max_concurrent_builds() -> usize {
    4
}

fn default_gc_enabled() -> bool {
    false
}
