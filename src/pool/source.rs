//! Candidate source seam
//!
//! Harvesters that pull endpoint lists from third-party APIs live outside
//! the core; the pool only consumes the strings they produce.

use async_trait::async_trait;

/// Produces candidate endpoint strings in any of the accepted shapes.
///
/// Implementations are expected to dedupe their own output; the pool
/// dedupes again against its working set, reserve, and retired keys.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Fetch up to `limit` candidate strings.
    async fn fetch(&self, limit: usize) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>>;

    /// Human-readable name for logs
    fn name(&self) -> &str;
}
