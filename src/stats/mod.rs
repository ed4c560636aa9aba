//! Introspection snapshots
//!
//! Consistent views of the path registry for API and metrics readers,
//! serializable as JSON. Snapshots are assembled by the manager from
//! per-path answers; they never expose live state.

use serde::Serialize;

use crate::source::SourceDescription;

/// State of one path at snapshot time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSnapshot {
    /// Path name
    pub name: String,

    /// Lifecycle state label (`waitingPublisher`, `ready`, ...)
    pub state: String,

    /// Whether the path currently has a stream
    pub ready: bool,

    /// Who feeds the path: a static source kind, or `publisher`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescription>,

    /// Attached readers
    pub reader_count: usize,

    /// Total payload bytes received on the current stream
    pub bytes_received: u64,

    /// Codec labels of the current stream, in description order
    pub tracks: Vec<String>,
}

/// Snapshot of the whole registry
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSnapshot {
    /// One entry per live path, in no particular order
    pub paths: Vec<PathSnapshot>,
}

impl ManagerSnapshot {
    /// Find a path snapshot by name
    pub fn path(&self, name: &str) -> Option<&PathSnapshot> {
        self.paths.iter().find(|p| p.name == name)
    }
}
