//! # The cache-or-generate engine
//!
//! [`CacheEngine::obtain_item`] is a hybrid "get cached or make on the spot" operation. To keep
//! latency low, requesters start receiving an object before its generation has finished:
//!
//! - The generation writes into a single temporary file opened for reading and writing,
//!   wrapped in a [`StreamPublisher`].
//! - The requester that started the generation, and every requester that asks for the same
//!   object while it is in progress, read from that file by position through their own
//!   [`StreamReader`](crate::StreamReader).
//! - Once generation has succeeded, the file handle is closed right away, so that no slow
//!   reader can hold back publishing, and the file is moved to stable storage without
//!   replacing an existing file. Requesters return only after that move.
//! - Readers whose reads were interrupted by that close independently open the file at its
//!   stable location, seek to where they were, and continue from there.
//!
//! Only the generating worker ever opens the object for writing, so this also works on
//! systems where a file opened for writing cannot be opened again.
//!
//! ## Coordination
//!
//! Objects in progress are tracked in a registry owned by the engine instance. The registry
//! lock is held for map operations only, never across I/O or while waiting. Every entry has
//! its own completion monitor. The worker moves the file into place *before* removing its
//! entry, so a requester that finds no entry will find the stable file, with one exception:
//! a requester may check stable storage, then the registry, and miss a worker finishing in
//! between. An owner therefore checks stable storage once more after registering, and
//! withdraws its entry if the object appeared in the meantime.
//!
//! Generation failures are not retried. They are reported to every requester that joined the
//! failed generation, and since the entry is removed at the same time, the next request starts
//! a fresh generation.
//!
//! ## Metrics
//!
//! - `engine.access`: All requests.
//! - `engine.in_flight`: Objects being generated or removed, sampled when a generation starts.
//! - `engine.file.hit`: Requests served directly from stable storage.
//! - `engine.join`: Requests joining a generation in progress.
//! - `engine.computation`: Generations started.
//! - `engine.generation.failed`: Generations that did not produce a stable file.
//! - `engine.generation.duration`: Time from starting a generation to publishing it.
//! - `engine.reopen`: Requests that continued from stable storage after a forced close.
//! - `engine.withdrawn`: Generations withdrawn before they started.
//! - `engine.remove`: Objects removed through [`CacheEngine::remove_item`].

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use tempfile::TempPath;

use crate::backend::{Backend, CopyDestination};
use crate::error::{GenerationError, ObtainError};
use crate::publisher::{StreamPublisher, Terminal};
use crate::utils::fs::{ClosableFile, catch_not_found, is_closed_handle_error};

type Publisher = StreamPublisher<ClosableFile>;

type Registry = HashMap<String, Arc<InFlight>>;

/// How an in-flight entry ended.
#[derive(Debug, Clone)]
enum Completion {
    /// The generation ran, and either published the object or failed.
    Generated(Result<(), GenerationError>),
    /// The entry was retracted without producing anything, requesters should start over.
    Restart,
}

/// An object currently being generated, or removed.
#[derive(Debug)]
struct InFlight {
    /// The stream being generated. Removal placeholders have none.
    publisher: Option<Arc<Publisher>>,
    completion: Mutex<Option<Completion>>,
    completed: Condvar,
}

impl InFlight {
    fn generating(publisher: Arc<Publisher>) -> Self {
        Self {
            publisher: Some(publisher),
            completion: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    fn placeholder() -> Self {
        Self {
            publisher: None,
            completion: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    /// Records how this entry ended, unless that happened already, and wakes all waiters.
    fn complete(&self, completion: Completion) {
        {
            let mut current = self
                .completion
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                *current = Some(completion);
            }
        }
        self.completed.notify_all();
    }

    /// Blocks until this entry is completed.
    fn wait(&self) -> Completion {
        let current = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self
            .completed
            .wait_while(current, |current| current.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        current.clone().unwrap_or(Completion::Restart)
    }
}

/// The marker a withdrawn generation cancels its stream with.
#[derive(Debug)]
struct Withdrawn;

impl fmt::Display for Withdrawn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("generation withdrawn")
    }
}

impl Error for Withdrawn {}

fn is_withdrawn(terminal: Option<&Terminal>) -> bool {
    match terminal {
        Some(Terminal::Cancelled(err)) => err.get_ref().is_some_and(|e| e.is::<Withdrawn>()),
        _ => false,
    }
}

/// Whether a request is done, or needs to start over.
enum Step {
    Done,
    Restart,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes `entry` from the registry, unless it was replaced already.
fn deregister(registry: &Mutex<Registry>, id: &str, entry: &Arc<InFlight>) {
    let mut registry = lock(registry);
    if registry.get(id).is_some_and(|e| Arc::ptr_eq(e, entry)) {
        registry.remove(id);
    }
}

/// Opens `filename` positioned at `offset`, or `None` if it does not exist.
fn open_at(filename: &Path, offset: u64) -> io::Result<Option<File>> {
    catch_not_found(|| {
        let mut file = File::open(filename)?;
        if offset != 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(file)
    })
}

/// Moves a finished temp file to `filename`, without replacing an existing file.
///
/// Another generation having published the same object first is not an error.
fn persist_tempfile(mut temp_path: TempPath, filename: &Path) -> io::Result<()> {
    let parent = filename
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // Something could clean up the directories we are operating in, so be defensive here
    // and retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn Error,
                path = %parent.display(),
                "Failed to create cache directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_path.persist_noclobber(filename) {
            Ok(()) => return Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(
                    path = %filename.display(),
                    "Cache file already exists, discarding generated copy",
                );
                return Ok(());
            }
            Err(e) => {
                temp_path = e.path;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn Error,
                    path = %filename.display(),
                    "Failed to persist cache file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Deletes a temp file that will not be published.
fn discard_tempfile(temp_path: TempPath) {
    let path = temp_path.to_path_buf();
    if let Err(e) = temp_path.close() {
        tracing::error!(
            error = &e as &dyn Error,
            path = %path.display(),
            "Failed to remove temp file",
        );
    }
}

/// The registry entry of a generation, ended when dropped.
///
/// A worker that stops without recording a result, because it could not be started or
/// because it panicked outside of the generator, completes its entry with
/// [`GenerationError::Aborted`] so that nobody waits forever.
struct Registration {
    registry: Arc<Mutex<Registry>>,
    id: String,
    entry: Arc<InFlight>,
    publisher: Arc<Publisher>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.publisher
            .cancel(io::Error::other(GenerationError::Aborted));
        self.entry
            .complete(Completion::Generated(Err(GenerationError::Aborted)));
        deregister(&self.registry, &self.id, &self.entry);
    }
}

/// Owns everything a background generation needs.
struct Worker<B: Backend> {
    backend: Arc<B>,
    info: Arc<B::Info>,
    filename: PathBuf,
    temp_path: TempPath,
    registration: Registration,
}

impl<B: Backend> Worker<B> {
    fn run(self) {
        let Worker {
            backend,
            info,
            filename,
            temp_path,
            registration,
        } = self;
        let Registration {
            id,
            entry,
            publisher,
            ..
        } = &registration;
        let id = id.as_str();

        let start = Instant::now();
        tracing::debug!(id, path = %filename.display(), "Generating object");

        let generated = panic::catch_unwind(AssertUnwindSafe(|| {
            backend.generate(&mut &**publisher, id, &info)
        }));
        let mut result = match generated {
            Ok(Ok(())) => {
                publisher.finish();
                Ok(())
            }
            Ok(Err(e)) => {
                let e = Arc::new(e);
                publisher.cancel(Arc::clone(&e));
                Err(GenerationError::Generate(e))
            }
            Err(_) => {
                publisher.cancel(io::Error::other("generator panicked"));
                Err(GenerationError::Panicked)
            }
        };

        // Readers still working on the handle get interrupted here, and continue from the
        // stable file once it is published. A failed stream stays open, so that readers can
        // drain it and receive its error, and is closed with the last reader.
        if result.is_ok() {
            if let Err(e) = publisher.sink().close() {
                result = Err(GenerationError::Close(Arc::new(e)));
            }
        }

        result = match result {
            Ok(()) => persist_tempfile(temp_path, &filename)
                .map_err(|e| GenerationError::Persist(Arc::new(e))),
            Err(e) => {
                discard_tempfile(temp_path);
                Err(e)
            }
        };

        match &result {
            Ok(()) => {
                metric!(timer("engine.generation.duration") = start.elapsed());
                tracing::debug!(
                    id,
                    bytes = publisher.written(),
                    path = %filename.display(),
                    "Published object",
                );
            }
            Err(e) => {
                metric!(counter("engine.generation.failed") += 1);
                tracing::warn!(error = e as &dyn Error, id, "Failed to generate object");
            }
        }

        entry.complete(Completion::Generated(result));
    }
}

/// Serves objects from stable storage, generating them on demand.
///
/// See the [module documentation](self) for how concurrent requests are coordinated. Cloning
/// an engine is cheap, clones share the same registry of objects in progress.
pub struct CacheEngine<B> {
    backend: Arc<B>,
    in_flight: Arc<Mutex<Registry>>,
}

impl<B> Clone for CacheEngine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<B> fmt::Debug for CacheEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("CacheEngine")
            .field("in_flight", &in_flight)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> CacheEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            in_flight: Default::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The number of objects currently being generated or removed.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Copies the object identified by `id` to `dest`, generating it first if necessary.
    ///
    /// Concurrent calls for the same `id` share a single generation. `info` is passed to the
    /// backend if this call ends up starting that generation.
    ///
    /// # Errors
    ///
    /// Fails if the destination fails, if the generation fails, or if stable storage cannot
    /// be accessed. A missing stable file is not an error, it triggers a generation.
    pub fn obtain_item<D>(&self, dest: &mut D, id: &str, info: B::Info) -> Result<(), ObtainError>
    where
        D: CopyDestination<B::Info> + ?Sized,
    {
        metric!(counter("engine.access") += 1);
        let filename = self.backend.make_filename(id);
        let info = Arc::new(info);

        loop {
            match self.try_obtain(dest, id, &info, &filename)? {
                Step::Done => return Ok(()),
                Step::Restart => {
                    tracing::trace!(id, "Restarting request");
                    continue;
                }
            }
        }
    }

    fn try_obtain<D>(
        &self,
        dest: &mut D,
        id: &str,
        info: &Arc<B::Info>,
        filename: &Path,
    ) -> Result<Step, ObtainError>
    where
        D: CopyDestination<B::Info> + ?Sized,
    {
        if let Some(mut file) = open_at(filename, 0).map_err(ObtainError::Open)? {
            metric!(counter("engine.file.hit") += 1);
            tracing::trace!(id, path = %filename.display(), "Serving from cache file");
            dest.copy_from(&mut file, id, info)
                .map_err(|e| ObtainError::Copy(e.error))?;
            return Ok(Step::Done);
        }

        let existing = lock(&self.in_flight).get(id).cloned();
        let entry = match existing {
            Some(entry) => {
                metric!(counter("engine.join") += 1);
                tracing::trace!(id, "Joining object in progress");
                entry
            }
            None => match self.start_generation(id, info, filename)? {
                Some(entry) => entry,
                None => return Ok(Step::Restart),
            },
        };

        self.consume(dest, id, info, filename, &entry)
    }

    /// Registers and starts a new generation, or joins one that was registered concurrently.
    ///
    /// Returns `None` if the object showed up in stable storage in the meantime.
    fn start_generation(
        &self,
        id: &str,
        info: &Arc<B::Info>,
        filename: &Path,
    ) -> Result<Option<Arc<InFlight>>, ObtainError> {
        let temp_file = self
            .backend
            .new_temp_file()
            .map_err(ObtainError::TempFile)?;
        let (file, temp_path) = temp_file.into_parts();
        let publisher = Arc::new(StreamPublisher::new(ClosableFile::new(file)));
        let entry = Arc::new(InFlight::generating(Arc::clone(&publisher)));

        {
            let mut registry = lock(&self.in_flight);
            // don't replace an entry that was made while we weren't looking
            if let Some(existing) = registry.get(id) {
                let existing = Arc::clone(existing);
                drop(registry);

                tracing::trace!(id, "Lost generation race, joining object in progress");
                metric!(counter("engine.join") += 1);
                drop(entry);
                drop(publisher);
                discard_tempfile(temp_path);
                return Ok(Some(existing));
            }
            registry.insert(id.to_owned(), Arc::clone(&entry));
            metric!(gauge("engine.in_flight") = registry.len() as u64);
        }

        if matches!(filename.try_exists(), Ok(true)) {
            metric!(counter("engine.withdrawn") += 1);
            tracing::trace!(id, "Cache file appeared, withdrawing generation");
            publisher.cancel(io::Error::other(Withdrawn));
            deregister(&self.in_flight, id, &entry);
            entry.complete(Completion::Restart);
            drop(entry);
            drop(publisher);
            discard_tempfile(temp_path);
            return Ok(None);
        }

        metric!(counter("engine.computation") += 1);
        let worker = Worker {
            backend: Arc::clone(&self.backend),
            info: Arc::clone(info),
            filename: filename.to_owned(),
            temp_path,
            registration: Registration {
                registry: Arc::clone(&self.in_flight),
                id: id.to_owned(),
                entry: Arc::clone(&entry),
                publisher,
            },
        };

        let spawned = thread::Builder::new()
            .name("genstore-worker".into())
            .spawn(move || worker.run());

        // a worker that never ran aborts its registration when dropped
        if let Err(e) = spawned {
            tracing::error!(error = &e as &dyn Error, id, "Failed to spawn worker");
        }

        Ok(Some(entry))
    }

    /// Streams an in-flight object to `dest`, continuing from stable storage if the stream
    /// gets closed from under us.
    fn consume<D>(
        &self,
        dest: &mut D,
        id: &str,
        info: &Arc<B::Info>,
        filename: &Path,
        entry: &InFlight,
    ) -> Result<Step, ObtainError>
    where
        D: CopyDestination<B::Info> + ?Sized,
    {
        let Some(publisher) = &entry.publisher else {
            // removal placeholders only ever complete with a restart
            return match entry.wait() {
                Completion::Generated(Err(e)) => Err(e.into()),
                _ => Ok(Step::Restart),
            };
        };

        let mut reader = publisher.new_reader();
        let done = match dest.copy_from(&mut reader, id, info) {
            Ok(_) => {
                // the object is only there once the worker has published it
                return match entry.wait() {
                    Completion::Generated(Err(e)) => Err(e.into()),
                    Completion::Generated(Ok(())) | Completion::Restart => Ok(Step::Done),
                };
            }
            Err(e) if is_closed_handle_error(&e.error) => e.copied,
            Err(e) => {
                if is_withdrawn(publisher.terminal().as_ref()) {
                    return Ok(Step::Restart);
                }
                return Err(ObtainError::Copy(e.error));
            }
        };

        // the handle is only closed once writing is over, check that it went well
        let terminal = publisher.terminal();
        let completion = match &terminal {
            Some(_) => entry.wait(),
            None => return Err(ObtainError::unexpected_state(terminal)),
        };
        match (completion, terminal) {
            (Completion::Generated(Err(e)), _) => return Err(e.into()),
            (Completion::Restart, _) => return Ok(Step::Restart),
            (Completion::Generated(Ok(())), Some(Terminal::Finished)) => {}
            (Completion::Generated(Ok(())), terminal) => {
                return Err(ObtainError::unexpected_state(terminal));
            }
        }

        metric!(counter("engine.reopen") += 1);
        tracing::debug!(id, offset = done, "Stream closed, resuming from cache file");

        match open_at(filename, done).map_err(ObtainError::Reopen)? {
            Some(mut file) => {
                dest.copy_from(&mut file, id, info)
                    .map_err(|e| ObtainError::Copy(e.error))?;
                Ok(Step::Done)
            }
            None => Err(ObtainError::MissingAfterGeneration),
        }
    }

    /// Removes the object identified by `id` from stable storage.
    ///
    /// Waits for a generation of the object in progress to end first. Requests arriving while
    /// the removal is in progress wait for it, and then generate the object anew.
    pub fn remove_item(&self, id: &str) -> io::Result<()> {
        self.remove_item_start(id)?.finish();
        Ok(())
    }

    /// Removes the object identified by `id`, keeping it blocked until the returned guard is
    /// dropped.
    ///
    /// This allows callers to update related state before the object can be generated again.
    /// If removing the file fails, the object is unblocked right away.
    pub fn remove_item_start(&self, id: &str) -> io::Result<RemovalGuard<'_, B>> {
        let filename = self.backend.make_filename(id);
        let placeholder = Arc::new(InFlight::placeholder());

        loop {
            let existing = {
                let mut registry = lock(&self.in_flight);
                match registry.get(id) {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        registry.insert(id.to_owned(), Arc::clone(&placeholder));
                        break;
                    }
                }
            };

            tracing::trace!(id, "Waiting for object in progress before removing");
            existing.wait();
            // a completed entry may stay registered for a moment
            thread::yield_now();
        }

        let guard = RemovalGuard {
            engine: self,
            id: id.to_owned(),
            placeholder,
        };

        match fs::remove_file(&filename) {
            Ok(()) => {
                metric!(counter("engine.remove") += 1);
                tracing::debug!(id, path = %filename.display(), "Removed cache file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(guard)
    }
}

/// Keeps an object blocked while it is being removed, see [`CacheEngine::remove_item_start`].
#[must_use = "the object is unblocked when the guard is dropped"]
pub struct RemovalGuard<'a, B> {
    engine: &'a CacheEngine<B>,
    id: String,
    placeholder: Arc<InFlight>,
}

impl<B> RemovalGuard<'_, B> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unblocks the object. Same as dropping the guard.
    pub fn finish(self) {}
}

impl<B> fmt::Debug for RemovalGuard<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovalGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<B> Drop for RemovalGuard<'_, B> {
    fn drop(&mut self) {
        deregister(&self.engine.in_flight, &self.id, &self.placeholder);
        self.placeholder.complete(Completion::Restart);
    }
}
