use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Source paths currently being processed.
///
/// A path can only be claimed once at a time; the claim is released when the
/// returned [`InFlightGuard`] is dropped, however the processing ended.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InFlight {
    /// Returns `None` if `path` is already claimed.
    pub fn try_claim(&self, path: &Path) -> Option<InFlightGuard> {
        let key = normalize(path);
        if !self.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard { paths: Arc::clone(&self.paths), key })
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set is always left consistent, so a poisoned lock is still usable.
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
    key: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

/// `a/./b` and `a//b` are the same file; the file may be gone already, so
/// there's no canonicalizing.
fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}
