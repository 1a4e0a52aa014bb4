//! In-memory endpoint for exercising the engine without OS handles.
//!
//! Reads replay a script of chunks and block, like a pending operation,
//! while the script is empty. Writes are collected. `close` wakes blocked
//! readers and is counted so tests can check teardown closed it once.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::endpoint::{closed_error, Endpoint, EndpointKind, IoMode};

enum Step {
    Data(Vec<u8>),
    Empty,
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Step>,
    written: Vec<u8>,
    write_fault: Option<io::ErrorKind>,
    max_write: Option<usize>,
    reads: usize,
}

pub struct MemoryEndpoint {
    name: String,
    inner: Mutex<Inner>,
    changed: Condvar,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl MemoryEndpoint {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, step: Step) {
        self.lock().script.push_back(step);
        self.changed.notify_all();
    }

    /// Queue a chunk for the next read
    pub fn push(&self, data: &[u8]) {
        self.enqueue(Step::Data(data.to_vec()));
    }

    /// Queue a read that reports zero bytes
    pub fn push_empty(&self) {
        self.enqueue(Step::Empty);
    }

    /// Queue the peer closing its end
    pub fn push_eof(&self) {
        self.enqueue(Step::Eof);
    }

    pub fn push_failure(&self, kind: io::ErrorKind) {
        self.enqueue(Step::Fail(kind));
    }

    /// Make every later write fail
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.lock().write_fault = Some(kind);
    }

    /// Accept at most `n` bytes per write call
    pub fn limit_writes(&self, n: usize) {
        self.lock().max_write = Some(n);
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Block until at least `len` bytes were written or `timeout` passes
    pub fn wait_written(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.written.len() < len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        inner.written.clone()
    }
}

impl Endpoint for MemoryEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Pipe
    }

    fn mode(&self) -> IoMode {
        IoMode::Overlapped
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        loop {
            if self.is_closed() {
                return Err(closed_error());
            }
            if let Some(step) = inner.script.pop_front() {
                inner.reads += 1;
                return match step {
                    Step::Data(mut data) => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        if n < data.len() {
                            inner.script.push_front(Step::Data(data.split_off(n)));
                        }
                        Ok(n)
                    }
                    Step::Empty => Ok(0),
                    Step::Eof => Err(io::ErrorKind::UnexpectedEof.into()),
                    Step::Fail(kind) => Err(kind.into()),
                };
            }
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if self.is_closed() {
            return Err(closed_error());
        }
        if let Some(kind) = inner.write_fault {
            return Err(kind.into());
        }
        let n = inner.max_write.map_or(buf.len(), |max| max.min(buf.len()));
        inner.written.extend_from_slice(&buf[..n]);
        drop(inner);
        self.changed.notify_all();
        Ok(n)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Take the lock so a reader between its check and its wait sees the flag
        let _inner = self.lock();
        self.changed.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
