//! ETL pipeline: pure stages plus the driver that composes them per job
//! kind.
//!
//! Stages know nothing about jobs; the driver owns job context and
//! cooperative cancellation.

pub mod chunk;
pub mod driver;
pub mod fetch;
pub mod parse;
pub mod store;
pub mod testing;

pub use chunk::{Chunk, ChunkConfig, ChunkMode, Chunker};
pub use driver::PipelineDriver;
pub use fetch::{FetchConfig, FetchedPage, HttpFetcher, PageFetcher};
pub use parse::parse;
pub use store::{DocumentMeta, DocumentSink, MemoryDocumentSink, PostgresDocumentStore};
