//! Executable loading seams.
//!
//! Loaders turn serialized executable formats into callable entry points. The
//! device retains its loader set for its whole lifetime and probes them in
//! registration order; compilation and caching strategies live behind the
//! trait.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, UnavailableSnafu};

/// A loaded executable exposing entry points by ordinal.
pub trait Executable: Send + Sync + fmt::Debug {
    fn entry_point_count(&self) -> usize;

    /// Invoke entry point `ordinal`. Out-of-range ordinals are
    /// `InvalidArgument`.
    fn invoke(&self, ordinal: usize) -> Result<()>;
}

/// Format-keyed executable loader.
pub trait ExecutableLoader: Send + Sync + fmt::Debug {
    /// Whether this loader understands `format` (e.g. a FourCC or MIME-ish
    /// identifier baked into the executable container).
    fn supports(&self, format: &str) -> bool;

    fn load(&self, format: &str, contents: &[u8]) -> Result<Arc<dyn Executable>>;
}

/// Probe `loaders` in order and load with the first that supports `format`.
pub fn load_executable(
    loaders: &[Arc<dyn ExecutableLoader>],
    format: &str,
    contents: &[u8],
) -> Result<Arc<dyn Executable>> {
    for loader in loaders {
        if loader.supports(format) {
            return loader.load(format, contents);
        }
    }
    UnavailableSnafu { reason: format!("no loader registered for executable format {format:?}") }.fail()
}
