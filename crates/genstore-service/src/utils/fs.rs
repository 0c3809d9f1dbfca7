//! File handles that can be closed from under their readers.

use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::publisher::Sink;

/// The error returned when operating on a [`ClosableFile`] after it was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleClosed;

impl fmt::Display for HandleClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("file already closed")
    }
}

impl Error for HandleClosed {}

impl From<HandleClosed> for io::Error {
    fn from(closed: HandleClosed) -> Self {
        io::Error::other(closed)
    }
}

/// Returns `true` if `err` means that the underlying handle was closed while in use.
///
/// This is the only place deciding whether an I/O error is a forced close, which callers
/// recover from by reopening the file under its final name. The whole source chain is
/// inspected, as destinations usually wrap the errors returned by their source.
pub fn is_closed_handle_error(err: &io::Error) -> bool {
    if EBADF.is_some() && err.raw_os_error() == EBADF {
        return true;
    }

    let mut source: Option<&(dyn Error + 'static)> = err
        .get_ref()
        .map(|e| e as &(dyn Error + 'static));
    while let Some(err) = source {
        if err.is::<HandleClosed>() {
            return true;
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if is_closed_handle_error(io_err) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

/// `EBADF` on Linux, Android, Apple platforms and the BSDs, which all define it as `9`.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
const EBADF: Option<i32> = Some(9);

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
)))]
const EBADF: Option<i32> = None;

/// A file shared between a single appending writer and any number of positional readers,
/// which the writer can close while readers still hold on to it.
///
/// All I/O is positional, so readers and the writer never compete for the file cursor.
/// Closing waits for reads that are already in progress, after which every operation fails
/// with [`HandleClosed`].
#[derive(Debug)]
pub struct ClosableFile {
    file: RwLock<Option<File>>,
    append_at: AtomicU64,
}

impl ClosableFile {
    pub fn new(file: File) -> Self {
        Self {
            file: RwLock::new(Some(file)),
            append_at: AtomicU64::new(0),
        }
    }

    /// Closes the handle after syncing its contents to disk.
    ///
    /// Closing twice is an error.
    pub fn close(&self) -> io::Result<()> {
        let file = self
            .file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(HandleClosed)?;
        file.sync_all()
    }

    pub fn is_closed(&self) -> bool {
        self.file
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn with_file<R>(&self, f: impl FnOnce(&File) -> io::Result<R>) -> io::Result<R> {
        let guard = self.file.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(HandleClosed.into()),
        }
    }
}

impl Sink for ClosableFile {
    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        // there is a single writer, so nobody moves `append_at` in between
        let offset = self.append_at.load(Ordering::Acquire);
        let written = self.with_file(|file| write_at(file, buf, offset))?;
        self.append_at
            .store(offset + written as u64, Ordering::Release);
        Ok(written)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.with_file(|file| read_at(file, buf, offset))
    }
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

/// Runs `f`, mapping a [`NotFound`](io::ErrorKind::NotFound) error to `Ok(None)`.
pub fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
