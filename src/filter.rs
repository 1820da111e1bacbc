//! Glob-based include/exclude evaluation.
//!
//! Patterns are compiled once. `*` matches within one path segment,
//! `**` crosses segments, anything else is a literal. A pattern excludes
//! a file when it matches either the full relative path or the basename.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct PathFilter {
    patterns: Vec<String>,
    globs: GlobSet,
}

impl PathFilter {
    /// Compile `patterns`; an invalid glob is reported as `Corrupt`
    /// configuration.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(trimmed)
                .literal_separator(true)
                .build()
                .map_err(|e| Error::Corrupt(format!("exclude pattern {trimmed:?}: {e}")))?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| Error::Corrupt(format!("exclude patterns: {e}")))?;
        Ok(Self {
            patterns: patterns.to_vec(),
            globs,
        })
    }

    pub fn empty() -> Self {
        Self::new(&[]).expect("empty pattern set compiles")
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `relative_path` is excluded, matching both the full path
    /// and its basename.
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let rel = relative_path.trim_start_matches('/');
        if self.globs.is_match(rel) {
            return true;
        }
        match rel.rsplit('/').next() {
            Some(basename) if basename != rel => self.globs.is_match(basename),
            _ => false,
        }
    }
}
