//! Echo suppression registry
//!
//! Every filesystem write the reconciler performs is pre-declared here so
//! the watcher can drop the event it generates. Tokens are counted: two
//! writes to the same path stack two tokens, and each consumes one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
pub struct IgnoreRegistry {
    tokens: Mutex<HashMap<PathBuf, usize>>,
}

impl IgnoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one upcoming write to `path`
    pub fn ignore(&self, path: &Path) {
        let mut tokens = self.tokens.lock();
        *tokens.entry(path.to_path_buf()).or_insert(0) += 1;
        trace!(path = %path.display(), "Ignore token added");
    }

    /// Consume one token for `path`; returns true when one existed
    pub fn consume(&self, path: &Path) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.get_mut(path) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    tokens.remove(path);
                }
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.tokens.lock().values().sum()
    }
}
