use crate::error::{NestDbError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Writes one collection to disk.
pub type PersistFn = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// A persistence failure observed by the background writer.
#[derive(Debug, Clone, Serialize)]
pub struct WriteFailure {
    pub collection: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

enum Command {
    Schedule(String),
    Flush(mpsc::Sender<Result<()>>),
    Shutdown(mpsc::Sender<Result<()>>),
}

/// Debounced collection writer.
///
/// Owns a background thread, its timer and the dirty set. Every
/// `schedule()` marks a collection dirty and restarts the window; when the
/// window elapses without further mutations each dirty collection is written
/// once. Failed collections stay dirty and are retried by the next window or
/// flush.
pub struct WriteScheduler {
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<Mutex<Vec<WriteFailure>>>,
}

impl WriteScheduler {
    /// Start the writer thread with the given debounce window.
    pub fn start(delay: Duration, persist: PersistFn) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let thread_failures = Arc::clone(&failures);

        let thread = std::thread::Builder::new()
            .name("nestdb-writer".to_string())
            .spawn(move || {
                let mut dirty: BTreeSet<String> = BTreeSet::new();
                let mut deadline: Option<Instant> = None;

                loop {
                    let received = match deadline {
                        Some(at) => rx.recv_timeout(at.saturating_duration_since(Instant::now())),
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(Command::Schedule(name)) => {
                            dirty.insert(name);
                            deadline = Some(Instant::now() + delay);
                        }
                        Ok(Command::Flush(reply)) => {
                            deadline = None;
                            let _ = reply.send(write_dirty(&mut dirty, &persist));
                        }
                        Ok(Command::Shutdown(reply)) => {
                            let _ = reply.send(write_dirty(&mut dirty, &persist));
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            deadline = None;
                            if let Err(e) = write_dirty(&mut dirty, &persist) {
                                log::error!("Deferred write failed: {e}");
                                record_failures(&thread_failures, &dirty, &e);
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            // Every handle is gone; write what is left and exit
                            if let Err(e) = write_dirty(&mut dirty, &persist) {
                                log::error!("Final write failed: {e}");
                            }
                            break;
                        }
                    }
                }
            })?;

        Ok(WriteScheduler {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            failures,
        })
    }

    /// Mark a collection dirty and restart the debounce window.
    pub fn schedule(&self, name: &str) {
        match lock(&self.tx).as_ref() {
            Some(tx) if tx.send(Command::Schedule(name.to_string())).is_ok() => {}
            _ => log::warn!("Write for '{name}' scheduled after shutdown; it will not be persisted"),
        }
    }

    /// Write every dirty collection now.
    pub fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        {
            let guard = lock(&self.tx);
            let tx = guard.as_ref().ok_or_else(|| {
                NestDbError::Other("store writer has been shut down".to_string())
            })?;
            tx.send(Command::Flush(reply_tx)).map_err(|_| writer_gone())?;
        }
        reply_rx.recv().map_err(|_| writer_gone())?
    }

    /// Final flush, then stop the thread. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let Some(tx) = lock(&self.tx).take() else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = mpsc::channel();
        let result = match tx.send(Command::Shutdown(reply_tx)) {
            Ok(()) => reply_rx.recv().map_err(|_| writer_gone()).and_then(|r| r),
            Err(_) => Err(writer_gone()),
        };
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                log::error!("Writer thread panicked");
            }
        }
        result
    }

    /// Drain failures recorded by background (timer-driven) writes.
    pub fn take_failures(&self) -> Vec<WriteFailure> {
        std::mem::take(&mut *lock(&self.failures))
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Writer shutdown failed: {e}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn writer_gone() -> NestDbError {
    NestDbError::Other("store writer thread is not running".to_string())
}

/// Write each dirty collection once. Failed names are kept for retry; the
/// error names all of them.
fn write_dirty(dirty: &mut BTreeSet<String>, persist: &PersistFn) -> Result<()> {
    let mut failed = BTreeSet::new();
    let mut messages = Vec::new();
    for name in std::mem::take(dirty) {
        match persist(&name) {
            Ok(()) => log::debug!("Persisted collection '{name}'"),
            Err(e) => {
                messages.push(format!("{name}: {e}"));
                failed.insert(name);
            }
        }
    }
    if failed.is_empty() {
        return Ok(());
    }
    let collection = failed.iter().cloned().collect::<Vec<_>>().join(", ");
    *dirty = failed;
    Err(NestDbError::Persistence {
        collection,
        message: messages.join("; "),
    })
}

fn record_failures(failures: &Mutex<Vec<WriteFailure>>, dirty: &BTreeSet<String>, error: &NestDbError) {
    let at = Utc::now();
    let mut failures = lock(failures);
    for name in dirty {
        failures.push(WriteFailure {
            collection: name.clone(),
            message: error.to_string(),
            at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<Mutex<Vec<String>>>, PersistFn) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&written);
        let persist: PersistFn = Arc::new(move |name: &str| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        });
        (written, persist)
    }

    #[test]
    fn test_burst_is_coalesced() {
        let (written, persist) = counting();
        let writer = WriteScheduler::start(Duration::from_millis(50), persist).unwrap();
        for _ in 0..10 {
            writer.schedule("users");
        }
        writer.schedule("posts");
        std::thread::sleep(Duration::from_millis(300));
        let mut seen = written.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["posts".to_string(), "users".to_string()]);
    }

    #[test]
    fn test_flush_writes_immediately() {
        let (written, persist) = counting();
        let writer = WriteScheduler::start(Duration::from_secs(60), persist).unwrap();
        writer.schedule("users");
        writer.flush().unwrap();
        assert_eq!(*written.lock().unwrap(), vec!["users".to_string()]);

        // Nothing dirty: a second flush writes nothing
        writer.flush().unwrap();
        assert_eq!(written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_flushes_and_is_idempotent() {
        let (written, persist) = counting();
        let writer = WriteScheduler::start(Duration::from_secs(60), persist).unwrap();
        writer.schedule("users");
        writer.shutdown().unwrap();
        assert_eq!(written.lock().unwrap().len(), 1);
        writer.shutdown().unwrap();
        assert!(writer.flush().is_err());
    }

    #[test]
    fn test_failures_are_reported_and_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let persist: PersistFn = Arc::new(move |name: &str| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(NestDbError::Other(format!("disk full writing {name}")))
            } else {
                Ok(())
            }
        });
        let writer = WriteScheduler::start(Duration::from_millis(20), persist).unwrap();
        writer.schedule("users");
        std::thread::sleep(Duration::from_millis(200));

        let failures = writer.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].collection, "users");
        assert!(failures[0].message.contains("disk full"));

        // Still dirty: the next flush retries and succeeds
        writer.flush().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
