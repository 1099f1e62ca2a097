//! Resource domains and handles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Permissions;

/// The fixed set of resource domains a capability can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Storage,
    Process,
    Network,
}

impl ResourceKind {
    pub const COUNT: usize = 4;

    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::Memory,
        ResourceKind::Storage,
        ResourceKind::Process,
        ResourceKind::Network,
    ];

    /// Position in provider tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Permissions that make sense for this kind of resource.
    pub fn supported_permissions(self) -> Permissions {
        match self {
            ResourceKind::Memory | ResourceKind::Process => Permissions::all(),
            ResourceKind::Storage => {
                Permissions::READ
                    | Permissions::WRITE
                    | Permissions::DELETE
                    | Permissions::GRANT
                    | Permissions::DELEGATE
            }
            ResourceKind::Network => {
                Permissions::READ | Permissions::WRITE | Permissions::GRANT | Permissions::DELEGATE
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Storage => "storage",
            ResourceKind::Process => "process",
            ResourceKind::Network => "network",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(ResourceKind::Memory),
            "storage" => Ok(ResourceKind::Storage),
            "process" => Ok(ResourceKind::Process),
            "network" => Ok(ResourceKind::Network),
            other => Err(format!("unknown resource kind '{}'", other)),
        }
    }
}

/// Opaque name of a provider-owned object.
///
/// A capability names a resource; the provider owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub handle: u64,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, handle: u64) -> Self {
        Self { kind, handle }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.handle)
    }
}
