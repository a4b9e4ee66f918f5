//! Template source readers.
//!
//! The expander reads sources through the [`Reader`] trait so storage is
//! pluggable. Non-existence must be reported as
//! [`VelaError::NotExist`] so the expander can turn it into a
//! position-bearing diagnostic at the offending directive.

use rustc_hash::FxHashMap;
use vela_core::{Context, VelaError, VelaResult};

/// A source of template bytes. Implementations must be safe for
/// concurrent use.
pub trait Reader: Send + Sync {
    /// Read the source at the absolute `path` for parsing in `ctx`.
    fn read(&self, path: &str, ctx: Context) -> VelaResult<Vec<u8>>;
}

impl<R: Reader + ?Sized> Reader for std::sync::Arc<R> {
    fn read(&self, path: &str, ctx: Context) -> VelaResult<Vec<u8>> {
        (**self).read(path, ctx)
    }
}

/// An in-memory reader over a fixed set of sources, keyed by absolute
/// path.
#[derive(Debug, Clone, Default)]
pub struct MapReader {
    sources: FxHashMap<String, Vec<u8>>,
}

impl MapReader {
    /// Create an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a source at `path`.
    pub fn insert(&mut self, path: impl Into<String>, src: impl Into<Vec<u8>>) {
        self.sources.insert(path.into(), src.into());
    }
}

impl<const N: usize> From<[(&str, &str); N]> for MapReader {
    fn from(entries: [(&str, &str); N]) -> Self {
        let mut reader = Self::new();
        for (path, src) in entries {
            reader.insert(path, src.as_bytes().to_vec());
        }
        reader
    }
}

impl Reader for MapReader {
    fn read(&self, path: &str, _ctx: Context) -> VelaResult<Vec<u8>> {
        self.sources
            .get(path)
            .cloned()
            .ok_or(VelaError::NotExist)
    }
}
