//! Maps session keys to running `codex` processes so a turn can be aborted
//! from outside the task that drives it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM on unix.
    Terminate,
    /// SIGKILL on unix.
    Kill,
}

/// Cloneable reference to a child owned by its turn driver. Signals are
/// delivered by the driver, which is the only holder of the `Child`.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    pid: Option<u32>,
    signal_tx: mpsc::UnboundedSender<KillSignal>,
    exited: CancellationToken,
}

/// Driver side of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessControl {
    signal_rx: mpsc::UnboundedReceiver<KillSignal>,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> (Self, ProcessControl) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let exited = CancellationToken::new();
        let handle = Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            signal_tx,
            exited: exited.clone(),
        };
        (handle, ProcessControl { signal_rx, exited })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Returns false once the driver has gone away.
    pub fn signal(&self, signal: KillSignal) -> bool {
        self.signal_tx.send(signal).is_ok()
    }

    /// Sends SIGTERM now and SIGKILL after `grace` unless the process has
    /// exited by then. The pending kill is dropped as soon as the process
    /// exits.
    pub fn terminate(&self, grace: Duration) -> bool {
        if !self.signal(KillSignal::Terminate) {
            return false;
        }
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.exited.cancelled() => {}
                _ = sleep(grace) => {
                    if handle.is_running() {
                        warn!(pid = ?handle.pid, "process did not terminate, forcing kill");
                        handle.signal(KillSignal::Kill);
                    }
                }
            }
        });
        true
    }
}

impl ProcessControl {
    pub async fn recv(&mut self) -> Option<KillSignal> {
        self.signal_rx.recv().await
    }

    pub fn mark_exited(&self) {
        self.exited.cancel();
    }
}

impl Drop for ProcessControl {
    fn drop(&mut self) {
        self.exited.cancel();
    }
}

/// Bookkeeping for one live turn.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub handle: ProcessHandle,
    pub temp_files: Vec<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

impl ProcessRecord {
    pub fn new(handle: ProcessHandle) -> Self {
        Self {
            handle,
            temp_files: Vec::new(),
            temp_dir: None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessRegistry {
    entries: StdMutex<HashMap<String, ProcessRecord>>,
    abort_grace: Duration,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ProcessRegistry {
    pub fn new(abort_grace: Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            abort_grace,
        }
    }

    /// No holder leaves the map half-updated, so poison is ignored.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, key: impl Into<String>, record: ProcessRecord) {
        let key = key.into();
        let mut entries = self.entries();
        if let Some(previous) = entries.insert(key.clone(), record) {
            warn!(
                key,
                pid = ?previous.handle.pid,
                "replaced a live process record; turns on one session must be serial"
            );
        }
    }

    pub fn remove(&self, key: &str) -> Option<ProcessRecord> {
        self.entries().remove(key)
    }

    /// Removes the entry that still refers to `handle`, under whatever key
    /// it ended up. A newer turn that reused the key is left alone.
    pub fn release(&self, handle: &ProcessHandle) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, record| record.handle.id != handle.id);
        entries.len() != before
    }

    /// Moves the record at `from` to `to`. Returns false when `from` is gone,
    /// e.g. because the turn was aborted in the meantime.
    pub fn rekey(&self, from: &str, to: &str) -> bool {
        if from == to {
            return self.contains(from);
        }
        let mut entries = self.entries();
        match entries.remove(from) {
            Some(record) => {
                entries.insert(to.to_string(), record);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// Exact key first, then any key that contains `session_id` or is
    /// contained in it.
    pub fn find_key(&self, session_id: &str) -> Option<String> {
        let entries = self.entries();
        matching_key(&entries, session_id)
    }

    /// Requests termination of the process for `session_id`. Returns whether
    /// a record was found, even if its driver finished before the signal
    /// could be delivered; it does not wait for the exit.
    pub fn abort(&self, session_id: &str) -> bool {
        let record = {
            let mut entries = self.entries();
            matching_key(&entries, session_id)
                .and_then(|key| entries.remove(&key).map(|record| (key, record)))
        };

        let Some((key, record)) = record else {
            debug!(session_id, "no process found to abort");
            return false;
        };
        if record.handle.terminate(self.abort_grace) {
            info!(session_id, key, pid = ?record.handle.pid, "aborting codex process");
        } else {
            debug!(key, "process already finished before abort");
        }
        true
    }

    /// Aborts every registered process. Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let records: Vec<ProcessRecord> = {
            let mut entries = self.entries();
            entries.drain().map(|(_, record)| record).collect()
        };
        records
            .iter()
            .filter(|record| record.handle.terminate(self.abort_grace))
            .count()
    }
}

fn matching_key(entries: &HashMap<String, ProcessRecord>, session_id: &str) -> Option<String> {
    if session_id.is_empty() {
        return None;
    }
    if entries.contains_key(session_id) {
        return Some(session_id.to_string());
    }
    entries
        .keys()
        .find(|key| key.contains(session_id) || session_id.contains(key.as_str()))
        .cloned()
}
