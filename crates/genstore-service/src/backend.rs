//! The collaborators plugged into a [`CacheEngine`](crate::CacheEngine).

use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::Config;

/// Knows where objects are stored, and how to generate them.
pub trait Backend: Send + Sync + 'static {
    /// Caller metadata, passed through to [`generate`](Self::generate) and the destination.
    type Info: Send + Sync + 'static;

    /// Returns the stable location of the object identified by `id`.
    ///
    /// This must be a pure function of `id`: requests for the same object are coordinated
    /// through this path, and generated files are published under it.
    fn make_filename(&self, id: &str) -> PathBuf;

    /// Allocates a temporary file for a new generation.
    ///
    /// The file is moved to [`make_filename`](Self::make_filename) once it is complete, so it
    /// should live on the same filesystem.
    fn new_temp_file(&self) -> io::Result<NamedTempFile>;

    /// Writes the full object identified by `id` into `sink`.
    ///
    /// Every generation of the same object must produce the same bytes. A requester that
    /// was interrupted may continue with a copy that another generation published.
    fn generate(&self, sink: &mut dyn Write, id: &str, info: &Self::Info) -> io::Result<()>;
}

/// An error that interrupted [`CopyDestination::copy_from`].
#[derive(Debug, Error)]
#[error("copy failed after {copied} bytes")]
pub struct CopyError {
    /// How many bytes were consumed from the source before the error occurred.
    pub copied: u64,
    #[source]
    pub error: io::Error,
}

impl CopyError {
    pub fn new(copied: u64, error: io::Error) -> Self {
        Self { copied, error }
    }
}

/// The final receiver of an object, for instance a network connection.
pub trait CopyDestination<I: ?Sized> {
    /// Copies everything from `src`, returning the number of consumed bytes.
    ///
    /// This may be called a second time for the same request, with a source that continues
    /// where the first one was interrupted.
    fn copy_from(&mut self, src: &mut dyn Read, id: &str, info: &I) -> Result<u64, CopyError>;
}

/// Turns a [`Write`] into a [`CopyDestination`].
#[derive(Debug)]
pub struct WriteDestination<W>(pub W);

impl<W> WriteDestination<W> {
    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: Write, I: ?Sized> CopyDestination<I> for WriteDestination<W> {
    fn copy_from(&mut self, src: &mut dyn Read, _id: &str, _info: &I) -> Result<u64, CopyError> {
        copy_counted(src, &mut self.0)
    }
}

impl<W> From<W> for WriteDestination<W> {
    fn from(value: W) -> Self {
        Self(value)
    }
}

/// Like [`io::copy`], but reports how much was copied when it fails.
pub fn copy_counted<W: Write + ?Sized>(src: &mut dyn Read, dst: &mut W) -> Result<u64, CopyError> {
    let mut buf = [0; 8 * 1024];
    let mut copied = 0;
    loop {
        let read = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::new(copied, e)),
        };
        dst.write_all(&buf[..read])
            .map_err(|e| CopyError::new(copied, e))?;
        copied += read as u64;
    }
    dst.flush().map_err(|e| CopyError::new(copied, e))?;
    Ok(copied)
}

/// The on-disk layout of a store: one directory per store for finished objects, and a shared
/// `tmp` directory for objects being generated.
#[derive(Debug, Clone)]
pub struct CacheDir {
    /// Name of the store, used for the directory name.
    name: String,
    /// Directory containing the finished objects.
    cache_dir: PathBuf,
    /// Directory for temporary files.
    ///
    /// Temporary files are moved into [`cache_dir`](Self::cache_dir) once fully written, so
    /// this must be on the same filesystem.
    tmp_dir: PathBuf,
}

impl CacheDir {
    /// Creates the layout below the configured cache directory.
    pub fn from_config(name: &str, config: &Config) -> io::Result<Self> {
        let base = config.cache_dir.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "no cache_dir configured! Did you provide a path to your config file?",
            )
        })?;
        Self::new(name, base)
    }

    /// Creates the layout below `base`, creating the store directory if needed.
    pub fn new(name: &str, base: &Path) -> io::Result<Self> {
        let cache_dir = base.join(name);
        std::fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            name: name.to_owned(),
            cache_dir,
            tmp_dir: base.join("tmp"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Returns the relative path of the object identified by `id`.
    ///
    /// Ids are arbitrary strings which may contain path separators or exceed file name limits,
    /// so the path is a sha-256 hash of the id, hex-formatted like so: `aa/bbccdd/eeff...`
    pub fn cache_path(id: &str) -> String {
        let hash = Sha256::digest(id.as_bytes());

        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    /// Returns the full path of the object identified by `id`.
    pub fn object_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(Self::cache_path(id))
    }

    /// Creates a new temporary file to generate an object into.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // Something could clean up the directory we are operating in, so be defensive here
        // and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create temp directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create temp file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// Clears the temporary files.
    ///
    /// This should happen on startup, to get rid of temporary files which survived a hard
    /// crash. It must not run while generations are in progress.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }
}
