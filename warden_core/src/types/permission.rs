//! Permission bits carried by capabilities.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

bitflags! {
    /// Set of rights a capability grants over its resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permissions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DELETE = 1 << 3;
        /// Mint new root capabilities over the same resource.
        const GRANT = 1 << 4;
        /// Derive narrower child capabilities.
        const DELEGATE = 1 << 5;

        /// Bits that let a holder operate on the resource.
        const USE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits() | Self::DELETE.bits();
    }
}

const NAMES: [(&str, Permissions); 6] = [
    ("read", Permissions::READ),
    ("write", Permissions::WRITE),
    ("execute", Permissions::EXECUTE),
    ("delete", Permissions::DELETE),
    ("grant", Permissions::GRANT),
    ("delegate", Permissions::DELEGATE),
];

impl Permissions {
    pub fn is_subset_of(self, other: Permissions) -> bool {
        other.contains(self)
    }

    /// Whether any operational bit is present.
    pub fn can_use(self) -> bool {
        self.intersects(Permissions::USE)
    }

    /// Parse a single permission name, case-insensitively.
    pub fn parse_name(name: &str) -> Result<Permissions, CapabilityError> {
        let lower = name.trim().to_ascii_lowercase();
        NAMES
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, p)| *p)
            .ok_or_else(|| CapabilityError::InvalidPermissions(format!("unknown permission '{}'", name)))
    }

    /// Parse a list of permission names into a set.
    pub fn from_names<I, S>(names: I) -> Result<Permissions, CapabilityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(Permissions::empty(), |acc, name| {
                Ok(acc | Permissions::parse_name(name.as_ref())?)
            })
    }

    /// Lowercase names of the bits that are set.
    pub fn names(self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(_, p)| self.contains(*p))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join("|"))
    }
}
