//! Size-bounded splitting of ingest payloads.
//!
//! Two splitters feed the ingest APIs: one groups JSON records for streaming
//! requests, the other cuts CSV files into record-aligned upload fragments
//! that each repeat the header row.

mod csv_chunker;
mod record_batcher;

pub use csv_chunker::{
    split_file, stream_fragments, ChunkConfig, ChunkResult, Fragment, FragmentStream,
};
pub use record_batcher::{serialized_size, split_records};
