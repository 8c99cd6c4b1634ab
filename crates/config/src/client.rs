// SPDX-License-Identifier: Apache-2.0

//! Client-side configuration.

use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::{AttrName, StorageConfig, TypeName};

/// Top-level client configuration: local attribute mappings plus applier
/// settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Per-type local attribute mappings, in declaration order.
    pub datamodel: IndexMap<TypeName, ClientTypeConfig>,

    /// How aggressively queued events are rewritten when newer events for
    /// the same object arrive.
    #[serde(default)]
    pub autoremediation: RemediationPolicy,

    /// How long removed objects stay in the trashbin before the removal is
    /// delivered for real. `None` disables the trashbin: removals are final
    /// immediately.
    #[serde(default, with = "humantime_serde")]
    pub trashbin_retention: Option<Duration>,

    /// Minimum interval between two retries of a queued event.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub errorqueue_retry_interval: Duration,

    /// Purge trashbin entries that cannot be re-keyed when the primary key
    /// specification of their type changes.
    #[serde(default = "default_true")]
    pub purge_trashbin_on_pkey_change: bool,

    /// Snapshot store settings for the local mirror, trashbin and error
    /// queue.
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_true() -> bool {
    true
}

impl ClientConfig {
    /// Creates a [`ClientConfig`] from a YAML string.
    pub fn from_yaml(yaml_str: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml_str).map_err(|e| Error::DeserializationError {
            format: "YAML".to_string(),
            details: e.to_string(),
        })
    }

    /// Creates a [`ClientConfig`] from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, Error> {
        serde_json::from_str(json_str).map_err(|e| Error::DeserializationError {
            format: "JSON".to_string(),
            details: e.to_string(),
        })
    }

    /// Loads a [`ClientConfig`] from a file, detecting the format from the
    /// file extension (`.json`, `.yaml`, `.yml`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = crate::read_config_file(path)?;
        match crate::extension_of(path)? {
            "json" => Self::from_json(&contents),
            "yaml" | "yml" => Self::from_yaml(&contents),
            other => Err(Error::UnsupportedExtension {
                extension: other.to_string(),
            }),
        }
    }
}

/// Local attribute mapping of one object type.
///
/// Keys are client attribute names; values are literal server attribute
/// names or template expressions over server attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientTypeConfig {
    /// client attribute name → value specification.
    pub attrsmapping: IndexMap<AttrName, String>,

    /// Display template for objects of this type.
    #[serde(rename = "toString", default)]
    pub to_string: Option<String>,
}

/// How aggressively queued events are rewritten when newer events for the
/// same object arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationPolicy {
    /// Events are only appended; nothing is rewritten.
    #[default]
    Disabled,
    /// Events of the same kind are merged, but no entry is ever cancelled.
    Conservative,
    /// The whole remediation algebra applies, including cancellations
    /// (an unprocessed add followed by a remove collapses to nothing).
    Maximum,
}
