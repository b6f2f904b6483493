pub mod chunker;
pub mod dispatcher;
pub mod embedding;
pub mod parsers;
pub mod pipeline;
pub mod quality;

pub use dispatcher::{run_worker_loop, WorkerConfig};
pub use pipeline::{IngestionPipeline, IngestionTuning};
