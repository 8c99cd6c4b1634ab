// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the consolidation engine.
//!
//! Data model:
//! - server: a *datamodel* maps object types to the sources they are
//!   assembled from, with per-source attribute mappings, constraints and
//!   queries;
//! - client: per-type local attribute mappings plus applier settings
//!   (autoremediation policy, trashbin retention, retry cadence).
//!
//! Everything here is declarative; templates are compiled by the expression
//! engine when a datamodel is built from this configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod datamodel;
pub mod error;

pub use client::{ClientConfig, ClientTypeConfig, RemediationPolicy};
pub use datamodel::{
    OnMergeConflict, PkeyMergeConstraint, PkeySpec, QuerySpec, QueryType, ServerConfig,
    SourceConfig, TypeConfig,
};
pub use error::Error;

/// The name of an object type in the datamodel.
pub type TypeName = String;

/// The name of a backing source.
pub type SourceName = String;

/// The name of an attribute.
pub type AttrName = String;

/// Settings for the on-disk snapshot store (server cache, client mirror,
/// trashbin, error queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the snapshot files.
    #[serde(default = "default_dirpath")]
    pub dirpath: PathBuf,

    /// Number of rotated backups kept per snapshot.
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,

    /// Compress snapshots with gzip.
    #[serde(default)]
    pub enable_compression: bool,
}

fn default_dirpath() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_backup_count() -> u32 {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dirpath: default_dirpath(),
            backup_count: default_backup_count(),
            enable_compression: false,
        }
    }
}

/// Scheduling settings shared by the server and client loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Interval between two passes.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Hard wall-clock limit for one pass; an overrunning pass is abandoned
    /// and retried on the next tick.
    #[serde(default = "default_pass_deadline", with = "humantime_serde")]
    pub pass_deadline: Duration,
}

fn default_update_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_pass_deadline() -> Duration {
    Duration::from_secs(300)
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            pass_deadline: default_pass_deadline(),
        }
    }
}

pub(crate) fn read_config_file(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
        details: e.to_string(),
    })
}

pub(crate) fn extension_of(path: &Path) -> Result<&str, Error> {
    path.extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| Error::UnsupportedExtension {
            extension: String::new(),
        })
}
