//! PubMed article metadata ingestion.
//!
//! Keys come from a CSV export, pages are fetched from PubMed by a bounded
//! pool of workers, fields are pulled out of the article HTML one locator at
//! a time, and accepted records are upserted into SQLite in fixed-size
//! batches by a single writer.

pub mod config;
pub mod db;
pub mod fetcher;
pub mod ingest;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod source;

pub use record::{ArticleRecord, ClusterTags, InputKey, NOT_FOUND};
