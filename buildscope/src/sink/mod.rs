//! # Event Sink
//!
//! Single-writer, many-producer asynchronous log.
//!
//! ```text
//! producer ──┐
//! producer ──┼──▶ unbounded queue ──▶ writer thread ──▶ header, records..., footer
//! producer ──┘          ▲
//!              finished() enqueues the terminal marker
//! ```
//!
//! Producers only pay for the enqueue. The dedicated writer thread is the sole
//! owner of the output and renders values in the order they were dequeued.
//! Each record is rendered into a scratch buffer and committed with a single
//! write + flush, so an abrupt exit can truncate the log only between records.
//!
//! After [`EventSink::finished`] (or [`EventSink::stop`]) every
//! [`EventSink::append`] is rejected with [`SinkError::Closed`]: nothing can
//! land behind the footer.

pub mod event;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};

use crate::domain::SinkError;

pub use event::{Event, EventKind};

/// Renders values of type `T` into the log. Header and footer are written once.
pub trait Renderer<T>: Send + 'static {
    /// # Errors
    /// Returns an error if the output cannot be written.
    fn header(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Returns an error if the output cannot be written.
    fn render(&mut self, value: &T, out: &mut dyn Write) -> io::Result<()>;

    /// # Errors
    /// Returns an error if the output cannot be written.
    fn footer(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

/// Counters reported once the writer thread has exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub records: usize,
}

enum Message<T> {
    Value(T),
    Finished,
}

type WriterResult = Result<SinkStats, SinkError>;

pub struct EventSink<T> {
    target: String,
    /// `None` once the terminal marker has been queued
    sender: RwLock<Option<Sender<Message<T>>>>,
    worker: Mutex<Option<JoinHandle<WriterResult>>>,
    /// How the writer ended; an error is kept as its message
    outcome: Mutex<Option<Result<SinkStats, String>>>,
}

impl<T: Send + 'static> EventSink<T> {
    /// Create (truncate) `path` and start the writer thread.
    ///
    /// # Errors
    /// Returns [`SinkError::Create`] if the file cannot be created.
    pub fn create(path: &Path, renderer: impl Renderer<T>) -> Result<Self, SinkError> {
        let file = File::create(path)
            .map_err(|source| SinkError::Create { path: path.to_path_buf(), source })?;
        Self::to_writer(path.display().to_string(), BufWriter::new(file), renderer)
    }

    /// Start the writer thread on an arbitrary output.
    ///
    /// # Errors
    /// Returns [`SinkError::Write`] if the writer thread cannot be spawned.
    pub fn to_writer(
        target: impl Into<String>,
        out: impl Write + Send + 'static,
        renderer: impl Renderer<T>,
    ) -> Result<Self, SinkError> {
        let target = target.into();
        let (tx, rx) = crossbeam_channel::unbounded();

        let thread_target = target.clone();
        let worker = thread::Builder::new()
            .name("buildscope-event-sink".to_string())
            .spawn(move || drain(&rx, renderer, out, &thread_target))
            .map_err(|source| SinkError::Write { target: target.clone(), source })?;

        debug!("Event sink writing to {target}");
        Ok(Self {
            target,
            sender: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            outcome: Mutex::new(None),
        })
    }

    /// Queue a value for rendering. Never blocks beyond queue contention.
    ///
    /// # Errors
    /// Returns [`SinkError::Closed`] once the sink has been finished or its
    /// writer has died.
    pub fn append(&self, value: T) -> Result<(), SinkError> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(Message::Value(value)).map_err(|_| SinkError::Closed),
            None => Err(SinkError::Closed),
        }
    }

    /// Queue the terminal marker without waiting for the writer.
    ///
    /// Values already queued are still rendered; later appends are rejected.
    pub fn finished(&self) {
        let mut sender = self.sender.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = sender.take() {
            let _ = tx.send(Message::Finished);
        }
    }

    /// Finish and block until header, every queued value and footer are written.
    ///
    /// Calling `stop` again returns the outcome of the first call: the same
    /// stats, or [`SinkError::Failed`] if the writer had failed.
    ///
    /// # Errors
    /// Returns the writer's I/O error, or [`SinkError::WriterPanicked`].
    pub fn stop(&self) -> Result<SinkStats, SinkError> {
        self.finished();

        let mut worker = lock(&self.worker);
        let Some(handle) = worker.take() else {
            return match lock(&self.outcome).clone() {
                Some(Ok(stats)) => Ok(stats),
                Some(Err(reason)) => Err(SinkError::Failed { target: self.target.clone(), reason }),
                None => Ok(SinkStats::default()),
            };
        };

        let result = handle.join().map_err(|_| SinkError::WriterPanicked).and_then(|r| r);
        *lock(&self.outcome) = Some(result.as_ref().copied().map_err(ToString::to_string));
        drop(worker);

        let stats = result?;
        debug!("Event sink {} closed after {} records", self.target, stats.records);
        Ok(stats)
    }

    /// Where this sink writes.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl<T> Drop for EventSink<T> {
    fn drop(&mut self) {
        let sender = self.sender.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = sender.take() {
            let _ = tx.send(Message::Finished);
        }
        let worker = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = worker.take() {
            match handle.join() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("{e}"),
                Err(_) => error!("Event sink writer for {} panicked", self.target),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn drain<T, R: Renderer<T>, W: Write>(
    rx: &Receiver<Message<T>>,
    mut renderer: R,
    mut out: W,
    target: &str,
) -> WriterResult {
    let write_err = |source| SinkError::Write { target: target.to_string(), source };
    let mut scratch = Vec::with_capacity(512);
    let mut stats = SinkStats::default();

    renderer.header(&mut scratch).map_err(write_err)?;
    commit(&mut out, &mut scratch).map_err(write_err)?;

    // A closed channel without a marker means the sink was dropped; still close the log
    for message in rx {
        match message {
            Message::Value(value) => {
                renderer.render(&value, &mut scratch).map_err(write_err)?;
                commit(&mut out, &mut scratch).map_err(write_err)?;
                stats.records += 1;
            }
            Message::Finished => break,
        }
    }

    renderer.footer(&mut scratch).map_err(write_err)?;
    commit(&mut out, &mut scratch).map_err(write_err)?;
    Ok(stats)
}

fn commit<W: Write>(out: &mut W, scratch: &mut Vec<u8>) -> io::Result<()> {
    if !scratch.is_empty() {
        out.write_all(scratch)?;
        scratch.clear();
    }
    out.flush()
}
