//! Engine registry.
//!
//! Maps engine names to the functions that build and open them. The
//! registry is a static table; adding an engine means adding a row.

use crate::config::EngineTuning;
use crate::error::{CoreError, CoreResult};
use crate::index::{cmap, radix, stree, Index};
use crate::pool::Pool;
use crate::transaction::Transaction;
use crate::types::{EngineKind, Handle};
use std::fmt;
use std::sync::Arc;

/// Builds an empty engine root inside the pool creation transaction.
pub(crate) type CreateFn = fn(&mut Transaction<'_>, &EngineTuning) -> CoreResult<Handle>;

/// Rebuilds the volatile state of an engine over an opened pool.
pub(crate) type OpenFn = fn(Arc<Pool>, Handle) -> CoreResult<Box<dyn Index>>;

/// One registered engine.
pub struct EngineEntry {
    /// Registry name.
    pub name: &'static str,
    /// Engine kind, also recorded in the pool header.
    pub kind: EngineKind,
    /// One-line description for tools.
    pub description: &'static str,
    pub(crate) create: CreateFn,
    pub(crate) open: OpenFn,
}

impl fmt::Debug for EngineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

static ENGINES: [EngineEntry; 3] = [
    EngineEntry {
        name: "cmap",
        kind: EngineKind::CMap,
        description: "concurrent hash map, unordered",
        create: cmap::create,
        open: cmap::open,
    },
    EngineEntry {
        name: "stree",
        kind: EngineKind::STree,
        description: "copy-on-write B+ tree, ordered",
        create: stree::create,
        open: stree::open,
    },
    EngineEntry {
        name: "radix",
        kind: EngineKind::Radix,
        description: "path-compressed radix trie, ordered",
        create: radix::create,
        open: radix::open,
    },
];

/// Returns every registered engine.
#[must_use]
pub fn engines() -> &'static [EngineEntry] {
    &ENGINES
}

/// Looks up an engine by name.
///
/// # Errors
///
/// Returns `EngineUnknown` if no engine has this name.
pub fn lookup(name: &str) -> CoreResult<&'static EngineEntry> {
    ENGINES
        .iter()
        .find(|entry| entry.name == name)
        .ok_or_else(|| CoreError::EngineUnknown {
            name: name.to_string(),
        })
}

/// Returns the entry of `kind`.
pub(crate) fn entry(kind: EngineKind) -> &'static EngineEntry {
    match kind {
        EngineKind::CMap => &ENGINES[0],
        EngineKind::STree => &ENGINES[1],
        EngineKind::Radix => &ENGINES[2],
    }
}
