//! Backend independent descriptors of storage mounted into session containers.
//!
//! A [`Volume`] only says *what* should appear in the container and *where*.
//! Every operator backend owns a total mapping from these descriptors to its
//! native volume declarations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Where and how a volume is mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
    pub container_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl MountPoint {
    pub fn new(name: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
            container_path: container_path.into(),
            sub_path: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        self.sub_path = Some(sub_path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Volume {
    /// An existing persistent volume (claim) referenced by name.
    Persistent {
        #[serde(flatten)]
        mount: MountPoint,
        volume_name: String,
    },
    /// A secret projected into the container as files.
    SecretReference {
        #[serde(flatten)]
        mount: MountPoint,
        secret_name: String,
        #[serde(default)]
        optional: bool,
    },
    /// Scratch space living as long as the session.
    Empty {
        #[serde(flatten)]
        mount: MountPoint,
    },
}

impl Volume {
    pub fn persistent(mount: MountPoint, volume_name: impl Into<String>) -> Self {
        Volume::Persistent {
            mount,
            volume_name: volume_name.into(),
        }
    }

    pub fn secret(mount: MountPoint, secret_name: impl Into<String>, optional: bool) -> Self {
        Volume::SecretReference {
            mount,
            secret_name: secret_name.into(),
            optional,
        }
    }

    pub fn empty(mount: MountPoint) -> Self {
        Volume::Empty { mount }
    }

    pub fn mount(&self) -> &MountPoint {
        match self {
            Volume::Persistent { mount, .. }
            | Volume::SecretReference { mount, .. }
            | Volume::Empty { mount } => mount,
        }
    }

    pub fn name(&self) -> &str {
        &self.mount().name
    }

    pub fn read_only(&self) -> bool {
        self.mount().read_only
    }

    pub fn container_path(&self) -> &str {
        &self.mount().container_path
    }

    pub fn sub_path(&self) -> Option<&str> {
        self.mount().sub_path.as_deref()
    }
}

/// Returns the first volume name that appears more than once.
pub fn find_duplicate_name(volumes: &[Volume]) -> Option<&str> {
    let mut seen = HashSet::new();
    volumes
        .iter()
        .map(Volume::name)
        .find(|name| !seen.insert(*name))
}
