use std::time::Duration;

use crate::chunker::ChunkerConfig;

/// Per-stage deadlines and chunking budget for one pipeline instance.
#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub parse_deadline: Duration,
    pub chunk_deadline: Duration,
    pub embed_deadline: Duration,
    pub chunker: ChunkerConfig,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            parse_deadline: Duration::from_secs(5 * 60),
            chunk_deadline: Duration::from_secs(5 * 60),
            embed_deadline: Duration::from_secs(10 * 60),
            chunker: ChunkerConfig::default(),
        }
    }
}
