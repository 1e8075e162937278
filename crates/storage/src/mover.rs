//! Crash-safe file relocation.
//!
//! A file only ever appears under its final name with all of its content.
//!
//! 1. **Same volume:** hard-link the source under the first free name in the
//!    destination directory, then unlink the source. `link` fails with
//!    `AlreadyExists` instead of replacing anything, so the first free name
//!    is claimed and published in one step; taken names fall through to
//!    `name (1).ext`, `name (2).ext` and so on.
//! 2. **Across volumes** (`link` reports `CrossesDevices`): copy into a hidden,
//!    uniquely named partial file in the destination directory, verify both
//!    hashes, publish the partial the same way, and only then delete the
//!    source.
//!
//! If the process dies halfway, at most a hidden `.docket-partial` file is
//! left behind. Any failure cleans up after itself and leaves the source
//! where it was.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::ffi::{OsStr, OsString};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Highest ` (n)` suffix tried before giving up on a destination directory.
pub const MAX_SUFFIX: u32 = 999;

const PARTIAL_SUFFIX: &str = "docket-partial";

static STAGED: AtomicU64 = AtomicU64::new(0);

/// How a file reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Atomic link-then-unlink within one volume.
    Renamed,
    /// Copy, verify and delete across volumes.
    Copied,
}

/// The result of a successful [`Mover::relocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moved {
    pub destination: PathBuf,
    pub strategy: Strategy,
    /// `true` when the plain file name was taken and a numbered one was used.
    pub disambiguated: bool,
}

#[derive(Debug, Clone)]
pub struct Mover {
    retries: u32,
    backoff: Duration,
    max_suffix: u32,
}

impl Default for Mover {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

impl Mover {
    /// `retries` extra attempts are made while the source is locked, waiting
    /// `backoff * attempt` between them.
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff, max_suffix: MAX_SUFFIX }
    }

    pub fn with_max_suffix(mut self, max_suffix: u32) -> Self {
        self.max_suffix = max_suffix;
        self
    }

    /// Moves `source` into `directory`, keeping its file name unless that
    /// name is already taken.
    #[instrument(skip(self), fields(source = %source.display(), directory = %directory.display()))]
    pub async fn relocate(&self, source: &Path, directory: &Path) -> Result<Moved> {
        let metadata = fs::symlink_metadata(source).await.map_err(|e| ErrorKind::source_io(e, source))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotAFile(source.to_path_buf()));
        }
        let name = source.file_name().ok_or_raise(|| ErrorKind::InvalidPath(source.to_path_buf()))?;

        fs::create_dir_all(directory).await.or_raise(|| ErrorKind::DestinationCreateFailed(directory.to_path_buf()))?;

        let mut attempt = 0;
        loop {
            let err = match self.publish(source, directory, name).await {
                Ok(Some((destination, disambiguated))) => {
                    self.remove_source(source, &destination).await?;
                    debug!(destination = %destination.display(), "relocated");
                    return Ok(Moved { destination, strategy: Strategy::Renamed, disambiguated });
                },
                Ok(None) => exn::bail!(ErrorKind::CollisionUnresolved(directory.join(name))),
                Err(e) if e.kind() == IoErrorKind::CrossesDevices => {
                    let (destination, disambiguated) = self.copy_across(source, directory, name).await?;
                    debug!(destination = %destination.display(), "copied across volumes");
                    return Ok(Moved { destination, strategy: Strategy::Copied, disambiguated });
                },
                Err(e) => e,
            };
            if err.kind() == IoErrorKind::NotFound {
                exn::bail!(ErrorKind::source_io(err, source));
            }
            if !is_locked(&err) {
                return Err(err).or_raise(|| ErrorKind::DestinationCreateFailed(directory.to_path_buf()));
            }
            if attempt >= self.retries {
                return Err(err).or_raise(|| ErrorKind::LockedSource(source.to_path_buf()));
            }
            attempt += 1;
            warn!(attempt, retries = self.retries, "source is locked, retrying");
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }

    /// Gives `file` the first free name in `directory`, returning it and
    /// whether a suffix was needed. `None` once every suffix is taken.
    async fn publish(&self, file: &Path, directory: &Path, name: &OsStr) -> std::io::Result<Option<(PathBuf, bool)>> {
        for n in 0..=self.max_suffix {
            let candidate = directory.join(numbered(name, n));
            match link_no_replace(file, &candidate).await {
                Ok(()) => return Ok(Some((candidate, n > 0))),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Claims a fresh hidden partial file in `directory`.
    async fn stage(&self, directory: &Path, name: &OsStr) -> Result<PathBuf> {
        loop {
            let staged = directory.join(partial_name(name));
            match fs::OpenOptions::new().write(true).create_new(true).open(&staged).await {
                Ok(_) => return Ok(staged),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e).or_raise(|| ErrorKind::DestinationCreateFailed(staged)),
            }
        }
    }

    /// Copy to a partial file, verify, publish it, then delete the source.
    async fn copy_across(&self, source: &Path, directory: &Path, name: &OsStr) -> Result<(PathBuf, bool)> {
        let staged = self.stage(directory, name).await?;
        let published: Result<(PathBuf, bool)> = async {
            fs::copy(source, &staged).await.map_err(|e| ErrorKind::source_io(e, source))?;
            let (expected, actual) = tokio::try_join!(hash(source), hash(&staged))?;
            if expected != actual {
                exn::bail!(ErrorKind::Verification(directory.join(name)));
            }
            self.publish(&staged, directory, name)
                .await
                .or_raise(|| ErrorKind::DestinationCreateFailed(directory.to_path_buf()))?
                .ok_or_raise(|| ErrorKind::CollisionUnresolved(directory.join(name)))
        }
        .await;
        // Once published the partial is only a second name for the copy.
        release(&staged).await;
        let (destination, disambiguated) = published?;
        self.remove_source(source, &destination).await?;
        Ok((destination, disambiguated))
    }

    /// Unlinks the source now that `published` holds its content. If that
    /// fails `published` is removed again so the file never exists twice.
    async fn remove_source(&self, source: &Path, published: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            let err = match fs::remove_file(source).await {
                Ok(()) => return Ok(()),
                // Already moved by the rename fallback in `link_no_replace`.
                Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
                Err(e) => e,
            };
            if !is_locked(&err) {
                release(published).await;
                exn::bail!(ErrorKind::Io(err));
            }
            if attempt >= self.retries {
                release(published).await;
                return Err(err).or_raise(|| ErrorKind::LockedSource(source.to_path_buf()));
            }
            attempt += 1;
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }
}

/// Makes `file` reachable as `link` without replacing anything there.
///
/// Volumes without hard links get a `create_new` claim renamed over instead;
/// `file` is then moved rather than linked.
async fn link_no_replace(file: &Path, link: &Path) -> std::io::Result<()> {
    match fs::hard_link(file, link).await {
        Err(e) if matches!(e.kind(), IoErrorKind::Unsupported | IoErrorKind::PermissionDenied) => {
            fs::OpenOptions::new().write(true).create_new(true).open(link).await?;
            if let Err(e) = fs::rename(file, link).await {
                release(link).await;
                return Err(e);
            }
            Ok(())
        },
        linked => linked,
    }
}

/// `report.pdf` → `report (n).pdf`; `n == 0` leaves the name alone.
fn numbered(name: &OsStr, n: u32) -> OsString {
    if n == 0 {
        return name.to_os_string();
    }
    let path = Path::new(name);
    let mut numbered = path.file_stem().unwrap_or(name).to_os_string();
    numbered.push(format!(" ({n})"));
    if let Some(extension) = path.extension() {
        numbered.push(".");
        numbered.push(extension);
    }
    numbered
}

/// `report.pdf` → `.report.pdf.<pid>-<n>.docket-partial`
fn partial_name(name: &OsStr) -> OsString {
    let mut partial = OsString::from(".");
    partial.push(name);
    partial.push(format!(".{}-{}.{PARTIAL_SUFFIX}", std::process::id(), STAGED.fetch_add(1, Ordering::Relaxed)));
    partial
}

fn is_locked(err: &std::io::Error) -> bool {
    if err.kind() == IoErrorKind::ResourceBusy {
        return true;
    }
    // ERROR_ACCESS_DENIED, ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(5 | 32 | 33))
}

async fn hash(path: &Path) -> Result<blake3::Hash> {
    let owned = path.to_path_buf();
    let hashed = tokio::task::spawn_blocking(move || -> std::io::Result<blake3::Hash> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(std::fs::File::open(&owned)?)?;
        Ok(hasher.finalize())
    })
    .await
    .or_raise(|| ErrorKind::Verification(path.to_path_buf()))?;
    hashed.or_raise(|| ErrorKind::Verification(path.to_path_buf()))
}

async fn release(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != IoErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "could not clean up after failed move");
    }
}
