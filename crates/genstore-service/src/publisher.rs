//! A single-writer, multi-reader byte stream over a random-access sink.
//!
//! The writer appends bytes through [`StreamPublisher::write`] and eventually seals the stream
//! with [`finish`](StreamPublisher::finish) or [`cancel`](StreamPublisher::cancel). Readers
//! created through [`new_reader`](StreamPublisher::new_reader) can attach at any time, always
//! start at offset `0`, and block until more bytes are written or the stream is sealed.
//!
//! Readers never observe bytes beyond what the writer has committed, and a cancelled stream
//! hands out all committed bytes before reporting the cancellation error.

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Storage behind a [`StreamPublisher`].
///
/// Bytes are appended sequentially by one writer, while any number of readers concurrently
/// read already appended bytes by position.
pub trait Sink: Send + Sync {
    /// Appends bytes at the end of the sink, returning how many were written.
    fn append(&self, buf: &[u8]) -> io::Result<usize>;

    /// Reads bytes starting at `offset`, without affecting appends.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// The irreversible end-of-stream state of a [`StreamPublisher`].
#[derive(Debug, Clone)]
pub enum Terminal {
    /// The writer wrote everything there is.
    Finished,
    /// The writer failed, readers receive this error once they have drained all bytes.
    Cancelled(Arc<io::Error>),
}

impl Terminal {
    pub fn is_finished(&self) -> bool {
        matches!(self, Terminal::Finished)
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Finished => f.write_str("finished"),
            Terminal::Cancelled(err) => write!(f, "cancelled: {err}"),
        }
    }
}

/// The error a [`StreamReader`] returns once it reaches the end of a cancelled stream.
///
/// It keeps the [`ErrorKind`](io::ErrorKind) of the cancellation error, and exposes that
/// error as its source.
#[derive(Debug, Clone)]
pub struct StreamCancelled(pub Arc<io::Error>);

impl fmt::Display for StreamCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream cancelled: {}", self.0)
    }
}

impl Error for StreamCancelled {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.0)
    }
}

impl StreamCancelled {
    fn to_io_error(&self) -> io::Error {
        io::Error::new(self.0.kind(), self.clone())
    }
}

#[derive(Debug, Default)]
struct State {
    /// Total number of bytes committed by the writer.
    written: u64,
    terminal: Option<Terminal>,
}

/// The writing half of a shared stream, see the [module docs](self).
#[derive(Debug)]
pub struct StreamPublisher<S> {
    sink: S,
    state: Mutex<State>,
    changed: Condvar,
}

impl<S: Sink> StreamPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: Mutex::default(),
            changed: Condvar::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `buf` to the sink and makes the written bytes visible to readers.
    ///
    /// The result of the sink is returned unchanged, including partial writes. A sink error
    /// seals the stream with that error.
    ///
    /// Must not be called after the stream was sealed.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let result = self.sink.append(buf);

        {
            let mut state = self.state();
            debug_assert!(state.terminal.is_none(), "write after end of stream");
            match &result {
                Ok(written) => state.written += *written as u64,
                Err(err) => {
                    if state.terminal.is_none() {
                        let copy = io::Error::new(err.kind(), err.to_string());
                        state.terminal = Some(Terminal::Cancelled(Arc::new(copy)));
                    }
                }
            }
        }

        // wake up readers, even if nothing was written
        self.changed.notify_all();
        result
    }

    /// Seals the stream successfully.
    ///
    /// This does not close the sink, as readers may still be reading from it.
    pub fn finish(&self) {
        self.seal(Terminal::Finished);
    }

    /// Seals the stream with an error.
    pub fn cancel(&self, error: impl Into<Arc<io::Error>>) {
        self.seal(Terminal::Cancelled(error.into()));
    }

    fn seal(&self, terminal: Terminal) {
        {
            let mut state = self.state();
            if state.terminal.is_none() {
                state.terminal = Some(terminal);
            }
        }
        self.changed.notify_all();
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.state().written
    }

    /// The terminal state, if the stream was sealed already.
    pub fn terminal(&self) -> Option<Terminal> {
        self.state().terminal.clone()
    }

    /// Creates a reader starting at the beginning of the stream.
    pub fn new_reader(self: &Arc<Self>) -> StreamReader<S> {
        StreamReader {
            publisher: Arc::clone(self),
            consumed: 0,
        }
    }

    /// Blocks until there is something for a reader at `consumed` to observe.
    fn wait_readable(&self, consumed: u64) -> (u64, Option<Terminal>) {
        let state = self.state();
        let state = self
            .changed
            .wait_while(state, |state| {
                consumed >= state.written && state.terminal.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
        (state.written, state.terminal.clone())
    }
}

impl<S: Sink> Write for &StreamPublisher<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StreamPublisher::write(*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reading cursor into a [`StreamPublisher`].
///
/// Each reader tracks its own position, so many readers can follow the same stream
/// independently. A single reader is not meant to be shared between threads.
#[derive(Debug)]
pub struct StreamReader<S> {
    publisher: Arc<StreamPublisher<S>>,
    consumed: u64,
}

impl<S: Sink> StreamReader<S> {
    /// Number of bytes this reader has returned so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn publisher(&self) -> &Arc<StreamPublisher<S>> {
        &self.publisher
    }
}

impl<S: Sink> Read for StreamReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (written, terminal) = self.publisher.wait_readable(self.consumed);

        if self.consumed < written {
            let available = written - self.consumed;
            let len = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
            let read = self.publisher.sink.read_at(&mut buf[..len], self.consumed)?;
            if read == 0 {
                // the sink lost bytes that were reported as written
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.consumed += read as u64;
            return Ok(read);
        }

        match terminal {
            Some(Terminal::Cancelled(err)) => Err(StreamCancelled(err).to_io_error()),
            Some(Terminal::Finished) | None => Ok(0),
        }
    }
}
