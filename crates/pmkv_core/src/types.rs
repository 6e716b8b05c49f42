//! Core type definitions.

use crate::error::CoreError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Location of a block payload inside the pool.
///
/// A handle is the byte offset of the payload from the start of the region.
/// Offset zero always lies inside the pool header, so `Handle::NULL` never
/// names a real block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Creates a handle from a raw offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the null handle.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the region offset `delta` bytes into the payload.
    #[must_use]
    pub(crate) const fn at(self, delta: u64) -> u64 {
        self.0 + delta
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

/// The selectable index structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Concurrent hash map with striped bucket locks. Unordered.
    CMap,
    /// Copy-on-write B+ tree. Ordered.
    STree,
    /// Path-compressed nibble trie. Ordered.
    Radix,
}

impl EngineKind {
    /// Returns the registry name of the engine.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CMap => "cmap",
            Self::STree => "stree",
            Self::Radix => "radix",
        }
    }

    /// Returns the tag stored in the pool header.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::CMap => 1,
            Self::STree => 2,
            Self::Radix => 3,
        }
    }

    /// Resolves a pool header tag.
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::CMap),
            2 => Some(Self::STree),
            3 => Some(Self::Radix),
            _ => None,
        }
    }

    /// Returns true if iteration follows key order and ranges are supported.
    #[must_use]
    pub const fn is_ordered(self) -> bool {
        !matches!(self, Self::CMap)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineKind {
    type Err = CoreError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        crate::engine::lookup(name).map(|entry| entry.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_basics() {
        let handle = Handle::new(0x1010);
        assert_eq!(handle.as_u64(), 0x1010);
        assert!(!handle.is_null());
        assert!(Handle::NULL.is_null());
        assert_eq!(Handle::default(), Handle::NULL);
        assert_eq!(handle.at(8), 0x1018);
        assert_eq!(handle.to_string(), "@0x1010");
    }

    #[test]
    fn engine_tags_round_trip() {
        for kind in [EngineKind::CMap, EngineKind::STree, EngineKind::Radix] {
            assert_eq!(EngineKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(kind.name().parse::<EngineKind>().unwrap(), kind);
        }
        assert_eq!(EngineKind::from_tag(0), None);
    }

    #[test]
    fn unknown_engine_name() {
        let err = "vsmap".parse::<EngineKind>().unwrap_err();
        assert!(matches!(err, CoreError::EngineUnknown { ref name } if name == "vsmap"));
    }

    #[test]
    fn ordering_flags() {
        assert!(!EngineKind::CMap.is_ordered());
        assert!(EngineKind::STree.is_ordered());
        assert!(EngineKind::Radix.is_ordered());
    }
}
