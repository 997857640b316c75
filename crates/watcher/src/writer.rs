#![forbid(unsafe_code)]

//! Append-only JSON-lines event log.
//!
//! Records are serialized once, then written as a single complete line. A
//! write that fails part way is truncated back to the previous line end, so
//! a later record is never glued onto a fragment. A record whose write
//! still fails after the configured retries is counted as lost; the writer
//! never blocks enrichment waiting for storage to recover.

use crate::domain::EventRecord;
use crate::error::Error;
use config::{Persistence, WriteMode};
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub written: u64,
    pub lost: u64,
    pub buffered: u64,
    pub output_file: PathBuf,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    lost: AtomicU64,
    buffered: AtomicU64,
}

impl Counters {
    fn stats(&self, path: &Path) -> WriterStats {
        WriterStats {
            written: self.written.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            output_file: path.to_path_buf(),
        }
    }
}

fn open_log(path: &Path) -> Result<File, Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(Error::Persistence)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Persistence)
}

fn encode(record: &EventRecord) -> Option<Vec<u8>> {
    match serde_json::to_vec(record) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(err) => {
            warn!(%err, event = %record.event_id, "failed to serialize event");
            None
        }
    }
}

/// Append-only storage behind the writers.
pub(crate) trait LogFile: Write {
    /// Current length in bytes.
    fn end(&mut self) -> std::io::Result<u64>;

    /// Cut the file back to `len` bytes.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;

    /// Push written data to the storage device.
    fn persist(&mut self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn end(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn persist(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// `bytes` holding `count` records, written with bounded retries. A failed
/// attempt is cut back to where it started, so the file only ever holds
/// whole lines.
fn write_lines<F: LogFile>(
    file: &mut F,
    bytes: &[u8],
    count: u64,
    retries: u32,
    counters: &Counters,
) -> bool {
    let mut attempt = 0;
    loop {
        let start = file.end();
        let err = match file.write_all(bytes) {
            Ok(()) => {
                counters.written.fetch_add(count, Ordering::Relaxed);
                return true;
            }
            Err(err) => err,
        };
        discard_partial(file, start);
        if attempt < retries {
            debug!(%err, attempt, "event write failed, retrying");
            attempt += 1;
            continue;
        }
        counters.lost.fetch_add(count, Ordering::Relaxed);
        warn!(%err, records = count, "event write failed, records lost");
        return false;
    }
}

fn discard_partial<F: LogFile>(file: &mut F, start: std::io::Result<u64>) {
    let restored = start.and_then(|start| {
        if file.end()? > start {
            file.truncate(start)?;
        }
        Ok(())
    });
    if let Err(err) = restored {
        // Terminate the fragment so the next record starts on its own line.
        warn!(%err, "cannot remove partial record");
        let _ = file.write_all(b"\n");
    }
}

/// Synchronous writer: every record reaches the file before `write` returns.
#[derive(Debug)]
pub struct EventWriter {
    file: Mutex<File>,
    path: PathBuf,
    retries: u32,
    fsync: bool,
    counters: Counters,
}

impl EventWriter {
    pub fn open(path: impl Into<PathBuf>, retries: u32, fsync: bool) -> Result<Self, Error> {
        let path = path.into();
        let file = open_log(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            retries,
            fsync,
            counters: Counters::default(),
        })
    }

    pub fn write(&self, record: &EventRecord) -> bool {
        let Some(line) = encode(record) else {
            self.counters.lost.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let mut file = self.file.lock();
        write_lines(&mut *file, &line, 1, self.retries, &self.counters)
    }

    pub fn flush(&self) -> Result<(), Error> {
        let mut file = self.file.lock();
        file.flush().map_err(Error::Persistence)?;
        if self.fsync {
            file.sync_data().map_err(Error::Persistence)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> WriterStats {
        self.counters.stats(&self.path)
    }
}

enum Command {
    Record(Vec<u8>),
    Flush(Sender<Result<(), Error>>),
}

/// Batched writer: records go into a bounded buffer drained by one writer
/// thread. A full buffer rejects the record and counts it as lost.
#[derive(Debug)]
pub struct BatchWriter {
    tx: RwLock<Option<Sender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
    counters: Arc<Counters>,
}

struct BatchLoop<F> {
    rx: Receiver<Command>,
    file: F,
    batch_size: usize,
    retries: u32,
    fsync: bool,
    counters: Arc<Counters>,
}

impl<F: LogFile> BatchLoop<F> {
    const IDLE_FLUSH: Duration = Duration::from_millis(100);

    fn run(mut self) {
        let mut batch = Vec::new();
        let mut pending = 0u64;
        loop {
            let command = match self.rx.recv_timeout(Self::IDLE_FLUSH) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    self.write_batch(&mut batch, &mut pending);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match command {
                Command::Record(line) => {
                    batch.extend_from_slice(&line);
                    pending += 1;
                    if pending as usize >= self.batch_size {
                        self.write_batch(&mut batch, &mut pending);
                    }
                }
                Command::Flush(reply) => {
                    self.write_batch(&mut batch, &mut pending);
                    let _ = reply.send(self.sync());
                }
            }
        }
        self.write_batch(&mut batch, &mut pending);
        if let Err(err) = self.sync() {
            warn!(%err, "final event log sync failed");
        }
        debug!("event writer thread exited");
    }

    fn write_batch(&mut self, batch: &mut Vec<u8>, pending: &mut u64) {
        if *pending == 0 {
            return;
        }
        write_lines(&mut self.file, batch, *pending, self.retries, &self.counters);
        self.counters.buffered.fetch_sub(*pending, Ordering::Relaxed);
        batch.clear();
        *pending = 0;
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.flush().map_err(Error::Persistence)?;
        if self.fsync {
            self.file.persist().map_err(Error::Persistence)?;
        }
        Ok(())
    }
}

impl BatchWriter {
    pub fn open(
        path: impl Into<PathBuf>,
        capacity: usize,
        batch_size: usize,
        retries: u32,
        fsync: bool,
    ) -> Result<Self, Error> {
        let path = path.into();
        let file = open_log(&path)?;
        Self::spawn(file, path, capacity, batch_size, retries, fsync)
    }

    pub(crate) fn spawn<F: LogFile + Send + 'static>(
        file: F,
        path: PathBuf,
        capacity: usize,
        batch_size: usize,
        retries: u32,
        fsync: bool,
    ) -> Result<Self, Error> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = BatchLoop {
            rx,
            file,
            batch_size: batch_size.max(1),
            retries,
            fsync,
            counters: counters.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("memwatch-writer".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            tx: RwLock::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            path,
            counters,
        })
    }

    /// Never blocks. Returns `false` when the record was lost.
    pub fn enqueue(&self, record: &EventRecord) -> bool {
        let Some(line) = encode(record) else {
            self.counters.lost.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            self.counters.lost.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        self.counters.buffered.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(Command::Record(line)) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.counters.buffered.fetch_sub(1, Ordering::Relaxed);
                self.counters.lost.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Wait until everything enqueued so far is on disk.
    pub fn flush(&self) -> Result<(), Error> {
        let (reply, done) = flume::bounded(1);
        {
            let tx = self.tx.read();
            let Some(tx) = tx.as_ref() else {
                return Ok(());
            };
            tx.send(Command::Flush(reply))
                .map_err(|_| Error::Persistence(std::io::Error::other("writer thread is gone")))?;
        }
        done.recv()
            .map_err(|_| Error::Persistence(std::io::Error::other("writer thread is gone")))?
    }

    /// Drain the buffer and stop the writer thread.
    pub fn close(&self) {
        drop(self.tx.write().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.counters.stats(&self.path)
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// The configured writer.
#[derive(Debug)]
pub enum EventLog {
    Sync(EventWriter),
    Batched(BatchWriter),
}

impl EventLog {
    /// Open `<output_dir>/<file_name>` in the configured mode.
    pub fn open(output_dir: &Path, settings: &Persistence) -> Result<Self, Error> {
        let path = output_dir.join(&settings.file_name);
        Ok(match settings.mode {
            WriteMode::Sync => Self::Sync(EventWriter::open(
                path,
                settings.write_retries,
                settings.fsync,
            )?),
            WriteMode::Batched => Self::Batched(BatchWriter::open(
                path,
                settings.buffer_events,
                settings.batch_size,
                settings.write_retries,
                settings.fsync,
            )?),
        })
    }

    pub fn submit(&self, record: &EventRecord) -> bool {
        match self {
            Self::Sync(writer) => writer.write(record),
            Self::Batched(writer) => writer.enqueue(record),
        }
    }

    pub fn flush(&self) -> Result<(), Error> {
        match self {
            Self::Sync(writer) => writer.flush(),
            Self::Batched(writer) => writer.flush(),
        }
    }

    /// Flush and release. Batched mode joins the writer thread.
    pub fn close(&self) -> Result<(), Error> {
        match self {
            Self::Sync(writer) => writer.flush(),
            Self::Batched(writer) => {
                writer.close();
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        match self {
            Self::Sync(writer) => writer.stats(),
            Self::Batched(writer) => writer.stats(),
        }
    }
}
