use tracing::trace;

use super::keys::QueryKey;

/// The UI's query layer, which keeps its own in-memory copies of fetched data.
///
/// `invalidate` marks every query whose key starts with `key` as stale.
pub trait QueryLayer: Send + Sync {
    fn invalidate(&self, key: &QueryKey);

    fn clear(&self);
}

/// Query layer for headless use, where there is nothing to invalidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueryLayer;

impl QueryLayer for NoopQueryLayer {
    fn invalidate(&self, key: &QueryKey) {
        trace!(%key, "No query layer attached, skipping invalidation");
    }

    fn clear(&self) {}
}
