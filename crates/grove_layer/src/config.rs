use serde::Deserialize;

/// Tunables for the storage layer. All fields have workable defaults; the
/// struct deserializes from whatever configuration source the embedder uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Batch width used when a sequence definition does not carry one.
    pub default_sequence_cache_size: i64,
    /// Page size for resumable group scans when the caller passes none.
    pub group_scan_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_sequence_cache_size: 20,
            group_scan_page_size: 256,
        }
    }
}
