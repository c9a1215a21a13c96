//! Fetch and convert steps of the tile pipeline.
//!
//! Both steps sit behind traits so the orchestrator can be driven by fakes
//! in tests. Both are idempotent: a complete artifact already on disk is
//! reused and reported as 100%.

pub mod converter;
pub mod fetcher;

pub use converter::{Converter, ProgressParser, RegexProgressParser, SubprocessConverter};
pub use fetcher::{Fetcher, HttpFetcher, UrlTemplate};
