// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Target platform descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A build target platform: operating system, CPU architecture, and an
/// optional variant (e.g. `v8` for `arm`).
///
/// Platforms compare by value and order deterministically so that platform
/// sets iterate in a stable order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// The platform of the current process.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }

    pub fn linux_arm64() -> Self {
        Self::new("linux", "arm64")
    }

    /// Whether this platform satisfies `other` as a requirement. A requirement
    /// without a variant is satisfied by any variant of the same os/arch.
    pub fn satisfies(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (other.variant.is_none() || self.variant == other.variant)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}
