use std::error::Error;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use genstore_service::{Backend, CacheDir, CacheEngine, CopyDestination, CopyError};
use genstore_test::TempDir;
use tempfile::NamedTempFile;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A latch generations can be held back with.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    pub fn wait(&self) {
        let open = self.open.lock().unwrap();
        let _open = self.opened.wait_while(open, |open| !*open).unwrap();
    }
}

/// Describes what a [`TestBackend`] generates, passed as request info.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub chunks: Vec<&'static [u8]>,
    /// Holds back the generation before writing the chunk at the given index.
    pub gate: Option<(usize, Arc<Gate>)>,
    /// Fails the generation after all chunks were written.
    pub error: Option<&'static str>,
    pub panic: bool,
}

impl Script {
    pub fn new(chunks: &[&'static [u8]]) -> Self {
        Self {
            chunks: chunks.to_vec(),
            ..Default::default()
        }
    }

    pub fn gated(mut self, at: usize, gate: &Arc<Gate>) -> Self {
        self.gate = Some((at, Arc::clone(gate)));
        self
    }

    pub fn failing(mut self, error: &'static str) -> Self {
        self.error = Some(error);
        self
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// A backend generating objects according to a [`Script`], counting its generations.
pub struct TestBackend {
    dir: CacheDir,
    generations: AtomicUsize,
    before_temp_file: Mutex<Option<Hook>>,
}

impl TestBackend {
    pub fn new(base: &Path) -> Self {
        Self {
            dir: CacheDir::new("objects", base).unwrap(),
            generations: AtomicUsize::new(0),
            before_temp_file: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &CacheDir {
        &self.dir
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    /// Runs `hook` the next time a temp file is allocated.
    pub fn before_temp_file(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_temp_file.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Backend for TestBackend {
    type Info = Script;

    fn make_filename(&self, id: &str) -> PathBuf {
        self.dir.object_path(id)
    }

    fn new_temp_file(&self) -> io::Result<NamedTempFile> {
        let hook = self.before_temp_file.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.dir.tempfile()
    }

    fn generate(&self, sink: &mut dyn Write, _id: &str, script: &Script) -> io::Result<()> {
        self.generations.fetch_add(1, Ordering::SeqCst);

        for (index, chunk) in script.chunks.iter().enumerate() {
            if let Some((at, gate)) = &script.gate {
                if *at == index {
                    gate.wait();
                }
            }
            sink.write_all(chunk)?;
        }

        if script.panic {
            panic!("generator exploded");
        }
        match script.error {
            Some(error) => Err(io::Error::other(error)),
            None => Ok(()),
        }
    }
}

/// A destination collecting everything it receives, in small reads.
#[derive(Default)]
pub struct Recorder {
    pub data: Vec<u8>,
    /// How often the engine called [`CopyDestination::copy_from`].
    pub calls: usize,
    /// Runs once after the first successful read.
    pub after_first_read: Option<Hook>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.data).unwrap()
    }
}

impl CopyDestination<Script> for Recorder {
    fn copy_from(&mut self, src: &mut dyn Read, _id: &str, _info: &Script) -> Result<u64, CopyError> {
        self.calls += 1;

        let mut buf = [0; 4];
        let mut copied = 0;
        loop {
            match src.read(&mut buf) {
                Ok(0) => return Ok(copied),
                Ok(read) => {
                    self.data.extend_from_slice(&buf[..read]);
                    copied += read as u64;
                    if let Some(hook) = self.after_first_read.take() {
                        hook();
                    }
                }
                Err(e) => return Err(CopyError::new(copied, e)),
            }
        }
    }
}

/// A destination that gives up right away, like a client disconnecting.
pub struct Disconnected;

impl CopyDestination<Script> for Disconnected {
    fn copy_from(&mut self, _src: &mut dyn Read, _id: &str, _info: &Script) -> Result<u64, CopyError> {
        Err(CopyError::new(0, io::ErrorKind::BrokenPipe.into()))
    }
}

pub fn engine(dir: &TempDir) -> CacheEngine<TestBackend> {
    CacheEngine::new(TestBackend::new(dir.path()))
}

pub fn stable_path(engine: &CacheEngine<TestBackend>, id: &str) -> PathBuf {
    engine.backend().make_filename(id)
}

/// Lists the files left in the temp directory.
pub fn leftover_temp_files(engine: &CacheEngine<TestBackend>) -> Vec<PathBuf> {
    match fs::read_dir(engine.backend().dir().tmp_dir()) {
        Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => vec![],
        Err(e) => panic!("failed listing temp dir: {e}"),
    }
}

/// Renders `err` and all of its sources.
pub fn error_chain(err: &(dyn Error + 'static)) -> Vec<String> {
    let mut chain = vec![];
    let mut current = Some(err);
    while let Some(err) = current {
        chain.push(err.to_string());
        current = err.source();
    }
    chain
}
