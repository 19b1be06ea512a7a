//! Command Scheduler
//!
//! Serializes every write to one device. A single worker task pops frames
//! in FIFO order, writes them one at a time, waits a post-send delay (the
//! light has no flow control) and retries failed writes with backoff.
//!
//! ```text
//! [Controller] --enqueue/interrupt--> [queue] --pop--> [worker] --write--> [Transport]
//!      ^                                                   |
//!      +------------------ SchedulerEvent -----------------+
//! ```

use crate::domain::models::{BatchId, CommandId, CommandStatus};
use crate::error::ControllerError;
use crate::infrastructure::bluetooth::protocol::{MODE_DELAY_MS, PIXEL_DELAY_MS};
use crate::infrastructure::bluetooth::transport::{
    DeviceHandle, SharedTransport, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Finished statuses kept around for callers polling a ticket
const STATUS_HISTORY: usize = 1024;

/// Timing and retry policy
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wait after a mode/settings frame
    pub mode_delay: Duration,
    /// Wait after a pixel frame
    pub pixel_delay: Duration,
    /// Retries after the first failed write
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for each further one
    pub retry_backoff: Duration,
    /// A write not confirmed within this window counts as failed
    pub write_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode_delay: Duration::from_millis(MODE_DELAY_MS),
            pixel_delay: Duration::from_millis(PIXEL_DELAY_MS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Decides the post-send delay of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Mode,
    Pixels,
}

/// One frame waiting for the worker
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: CommandId,
    pub batch: BatchId,
    pub frame: Vec<u8>,
    pub post_delay: Duration,
    pub retries: u32,
}

/// Outcome reports sent back to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Acknowledged(CommandId),
    Failed { id: CommandId, error: ControllerError },
    Cancelled(CommandId),
    /// A write found the link gone; the worker has exited
    LinkLost,
}

struct QueueState {
    pending: VecDeque<QueueEntry>,
    in_flight: Option<CommandId>,
    statuses: HashMap<CommandId, CommandStatus>,
    finished: VecDeque<CommandId>,
    next_id: u64,
    next_batch: u64,
    /// Bumped by every flush; a retrying entry gives up when it changes
    epoch: u64,
}

impl QueueState {
    fn finish(&mut self, id: CommandId, status: CommandStatus) {
        self.statuses.insert(id, status);
        self.finished.push_back(id);
        while self.finished.len() > STATUS_HISTORY {
            if let Some(old) = self.finished.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }

    /// Cancel pending entries matching `pred`, returning their ids
    fn cancel_where(&mut self, pred: impl Fn(&QueueEntry) -> bool) -> Vec<CommandId> {
        let mut cancelled = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if pred(&entry) {
                cancelled.push(entry.id);
            } else {
                kept.push_back(entry);
            }
        }
        self.pending = kept;
        for id in &cancelled {
            self.finish(*id, CommandStatus::Cancelled);
        }
        cancelled
    }
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Notify,
    config: SchedulerConfig,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Shared {
    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_cancelled(&self, ids: &[CommandId]) {
        for id in ids {
            self.emit(SchedulerEvent::Cancelled(*id));
        }
    }
}

/// Per-device serialized dispatcher
pub struct CommandScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandScheduler {
    pub fn new(config: SchedulerConfig, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    in_flight: None,
                    statuses: HashMap::new(),
                    finished: VecDeque::new(),
                    next_id: 1,
                    next_batch: 1,
                    epoch: 0,
                }),
                wake: Notify::new(),
                config,
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Allocate an id grouping the frames of one intent
    pub fn next_batch(&self) -> BatchId {
        let mut q = self.shared.queue.lock();
        let batch = BatchId(q.next_batch);
        q.next_batch += 1;
        batch
    }

    fn make_entry(&self, q: &mut QueueState, batch: BatchId, frame: Vec<u8>, kind: FrameKind) -> QueueEntry {
        let id = CommandId(q.next_id);
        q.next_id += 1;
        q.statuses.insert(id, CommandStatus::Pending);
        let post_delay = match kind {
            FrameKind::Mode => self.shared.config.mode_delay,
            FrameKind::Pixels => self.shared.config.pixel_delay,
        };
        QueueEntry {
            id,
            batch,
            frame,
            post_delay,
            retries: self.shared.config.max_retries,
        }
    }

    /// Append a frame at the back of the queue
    pub fn enqueue(&self, batch: BatchId, frame: Vec<u8>, kind: FrameKind) -> CommandId {
        let id = {
            let mut q = self.shared.queue.lock();
            let entry = self.make_entry(&mut q, batch, frame, kind);
            let id = entry.id;
            q.pending.push_back(entry);
            id
        };
        self.shared.wake.notify_one();
        id
    }

    /// Flush everything pending and put `frames` at the head of the queue
    pub fn interrupt(&self, batch: BatchId, frames: Vec<(Vec<u8>, FrameKind)>) -> Vec<CommandId> {
        let (ids, cancelled) = {
            let mut q = self.shared.queue.lock();
            let cancelled = q.cancel_where(|_| true);
            q.epoch += 1;
            let mut ids = Vec::with_capacity(frames.len());
            for (frame, kind) in frames {
                let entry = self.make_entry(&mut q, batch, frame, kind);
                ids.push(entry.id);
                q.pending.push_back(entry);
            }
            (ids, cancelled)
        };
        if !cancelled.is_empty() {
            debug!("Interrupt flushed {} pending frame(s)", cancelled.len());
        }
        self.shared.emit_cancelled(&cancelled);
        self.shared.wake.notify_one();
        ids
    }

    /// Cancel the still-pending frames of one batch
    pub fn cancel_batch(&self, batch: BatchId) -> usize {
        let cancelled = self.shared.queue.lock().cancel_where(|e| e.batch == batch);
        self.shared.emit_cancelled(&cancelled);
        cancelled.len()
    }

    /// Cancel every pending frame
    pub fn clear(&self) -> usize {
        let cancelled = {
            let mut q = self.shared.queue.lock();
            q.epoch += 1;
            q.cancel_where(|_| true)
        };
        self.shared.emit_cancelled(&cancelled);
        cancelled.len()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Frames still waiting, front first
    pub fn pending_frames(&self) -> Vec<Vec<u8>> {
        self.shared
            .queue
            .lock()
            .pending
            .iter()
            .map(|e| e.frame.clone())
            .collect()
    }

    pub fn in_flight(&self) -> Option<CommandId> {
        self.shared.queue.lock().in_flight
    }

    /// Status of an entry; `None` once it has aged out of the history
    pub fn status(&self, id: CommandId) -> Option<CommandStatus> {
        self.shared.queue.lock().statuses.get(&id).cloned()
    }

    /// Number of entries currently in the `Sent` state
    pub fn sent_count(&self) -> usize {
        self.shared
            .queue
            .lock()
            .statuses
            .values()
            .filter(|s| **s == CommandStatus::Sent)
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start writing queued frames to `handle`
    pub fn start(&self, transport: SharedTransport, handle: DeviceHandle) {
        self.stop();
        info!("Command scheduler started for {}", handle.address);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run_worker(shared, transport, handle));
        *self.worker.lock() = Some(task);
        self.shared.wake.notify_one();
    }

    /// Stop the worker; an interrupted in-flight frame is reported as failed
    pub fn stop(&self) {
        let Some(task) = self.worker.lock().take() else {
            return;
        };
        task.abort();

        let interrupted = {
            let mut q = self.shared.queue.lock();
            match q.in_flight.take() {
                Some(id) => {
                    q.finish(id, CommandStatus::Failed(ControllerError::Disconnected));
                    Some(id)
                }
                None => None,
            }
        };
        if let Some(id) = interrupted {
            self.shared.emit(SchedulerEvent::Failed {
                id,
                error: ControllerError::Disconnected,
            });
        }
        info!("Command scheduler stopped");
    }
}

impl Drop for CommandScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.worker.lock().take() {
            task.abort();
        }
    }
}

async fn run_worker(shared: Arc<Shared>, transport: SharedTransport, handle: DeviceHandle) {
    loop {
        let next = {
            let mut q = shared.queue.lock();
            match q.pending.pop_front() {
                Some(entry) => {
                    q.in_flight = Some(entry.id);
                    q.statuses.insert(entry.id, CommandStatus::Sent);
                    Some((entry, q.epoch))
                }
                None => None,
            }
        };

        let Some((entry, epoch)) = next else {
            shared.wake.notified().await;
            continue;
        };

        if !dispatch(&shared, transport.as_ref(), &handle, entry, epoch).await {
            return;
        }
    }
}

/// Write one entry, retrying as configured. Returns false once the link is gone.
async fn dispatch(
    shared: &Shared,
    transport: &dyn Transport,
    handle: &DeviceHandle,
    entry: QueueEntry,
    epoch: u64,
) -> bool {
    let config = &shared.config;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        debug!("{} attempt {}: {:02X?}", entry.id, attempt, entry.frame);

        let result = match tokio::time::timeout(config.write_timeout, transport.write(handle, &entry.frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(()) => {
                {
                    let mut q = shared.queue.lock();
                    q.in_flight = None;
                    q.finish(entry.id, CommandStatus::Acknowledged);
                }
                shared.emit(SchedulerEvent::Acknowledged(entry.id));
                if !entry.post_delay.is_zero() {
                    tokio::time::sleep(entry.post_delay).await;
                }
                return true;
            }
            Err(TransportError::Disconnected) => {
                warn!("{} aborted: device disconnected", entry.id);
                let cancelled = {
                    let mut q = shared.queue.lock();
                    q.in_flight = None;
                    q.finish(entry.id, CommandStatus::Failed(ControllerError::Disconnected));
                    q.epoch += 1;
                    q.cancel_where(|_| true)
                };
                shared.emit(SchedulerEvent::Failed {
                    id: entry.id,
                    error: ControllerError::Disconnected,
                });
                shared.emit_cancelled(&cancelled);
                shared.emit(SchedulerEvent::LinkLost);
                return false;
            }
            Err(e) if attempt > entry.retries => {
                error!("{} failed after {} attempt(s): {}", entry.id, attempt, e);
                let error = ControllerError::WriteFailed {
                    attempts: attempt,
                    reason: e.to_string(),
                };
                {
                    let mut q = shared.queue.lock();
                    q.in_flight = None;
                    q.finish(entry.id, CommandStatus::Failed(error.clone()));
                }
                shared.emit(SchedulerEvent::Failed { id: entry.id, error });
                return true;
            }
            Err(e) => {
                let backoff = config.retry_backoff.saturating_mul(1 << (attempt - 1).min(16));
                warn!("{} write failed ({}), retrying in {:?}", entry.id, e, backoff);
                tokio::time::sleep(backoff).await;

                let superseded = {
                    let mut q = shared.queue.lock();
                    if q.epoch != epoch {
                        q.in_flight = None;
                        q.finish(entry.id, CommandStatus::Cancelled);
                        true
                    } else {
                        false
                    }
                };
                if superseded {
                    debug!("{} dropped: queue was flushed during backoff", entry.id);
                    shared.emit(SchedulerEvent::Cancelled(entry.id));
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::DryRunTransport;

    fn scheduler() -> (CommandScheduler, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CommandScheduler::new(SchedulerConfig::default(), tx), rx)
    }

    async fn connected(transport: &Arc<DryRunTransport>) -> DeviceHandle {
        transport.connect("AA:BB:CC:DD:EE:FF").await.unwrap()
    }

    #[test]
    fn test_interrupt_replaces_pending_entries() {
        let (scheduler, mut events) = scheduler();
        let batch = scheduler.next_batch();
        let queued: Vec<CommandId> = (0..10)
            .map(|i| scheduler.enqueue(batch, vec![0xDA, i], FrameKind::Pixels))
            .collect();

        let off_batch = scheduler.next_batch();
        let off = scheduler.interrupt(off_batch, vec![(vec![0xD0, 0x00], FrameKind::Mode)]);

        assert_eq!(scheduler.pending_len(), 1);
        assert_eq!(scheduler.pending_frames(), vec![vec![0xD0, 0x00]]);
        assert_eq!(scheduler.status(off[0]), Some(CommandStatus::Pending));
        for id in &queued {
            assert_eq!(scheduler.status(*id), Some(CommandStatus::Cancelled));
            assert_eq!(events.try_recv().unwrap(), SchedulerEvent::Cancelled(*id));
        }
    }

    #[test]
    fn test_cancel_batch_keeps_other_batches() {
        let (scheduler, _events) = scheduler();
        let effect = scheduler.next_batch();
        let other = scheduler.next_batch();
        scheduler.enqueue(effect, vec![1], FrameKind::Pixels);
        let keep = scheduler.enqueue(other, vec![2], FrameKind::Mode);
        scheduler.enqueue(effect, vec![3], FrameKind::Pixels);

        assert_eq!(scheduler.cancel_batch(effect), 2);
        assert_eq!(scheduler.pending_frames(), vec![vec![2]]);
        assert_eq!(scheduler.status(keep), Some(CommandStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_in_fifo_order_one_at_a_time() {
        let transport = Arc::new(DryRunTransport::new("Hello Fairy", None).with_latency(Duration::from_millis(5)));
        let handle = connected(&transport).await;
        let (scheduler, mut events) = scheduler();

        let batch = scheduler.next_batch();
        let ids: Vec<CommandId> = (0..5u8)
            .map(|i| scheduler.enqueue(batch, vec![i], FrameKind::Mode))
            .collect();
        scheduler.start(transport.clone(), handle);

        for id in &ids {
            assert!(scheduler.sent_count() <= 1);
            assert_eq!(events.recv().await, Some(SchedulerEvent::Acknowledged(*id)));
        }
        assert_eq!(transport.written(), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(transport.max_concurrent_writes(), 1);
        assert_eq!(scheduler.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let transport = Arc::new(DryRunTransport::new("Hello Fairy", None));
        let handle = connected(&transport).await;
        transport.fail_writes(2);
        let (scheduler, mut events) = scheduler();

        let batch = scheduler.next_batch();
        let id = scheduler.enqueue(batch, vec![0xAA], FrameKind::Mode);
        scheduler.start(transport.clone(), handle);

        assert_eq!(events.recv().await, Some(SchedulerEvent::Acknowledged(id)));
        assert_eq!(scheduler.status(id), Some(CommandStatus::Acknowledged));
        assert_eq!(transport.written(), vec![vec![0xAA]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_failure_and_continue() {
        let transport = Arc::new(DryRunTransport::new("Hello Fairy", None));
        let handle = connected(&transport).await;
        transport.fail_writes(4);
        let (scheduler, mut events) = scheduler();

        let batch = scheduler.next_batch();
        let doomed = scheduler.enqueue(batch, vec![0x01], FrameKind::Mode);
        let next = scheduler.enqueue(batch, vec![0x02], FrameKind::Mode);
        scheduler.start(transport.clone(), handle);

        match events.recv().await {
            Some(SchedulerEvent::Failed { id, error }) => {
                assert_eq!(id, doomed);
                assert!(matches!(error, ControllerError::WriteFailed { attempts: 4, .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events.recv().await, Some(SchedulerEvent::Acknowledged(next)));
        assert!(matches!(scheduler.status(doomed), Some(CommandStatus::Failed(_))));
        assert_eq!(transport.written(), vec![vec![0x02]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out() {
        let transport = Arc::new(DryRunTransport::new("Hello Fairy", None).with_latency(Duration::from_secs(10)));
        let handle = connected(&transport).await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let config = SchedulerConfig {
            max_retries: 0,
            ..SchedulerConfig::default()
        };
        let scheduler = CommandScheduler::new(config, tx);

        let batch = scheduler.next_batch();
        let id = scheduler.enqueue(batch, vec![0x01], FrameKind::Pixels);
        scheduler.start(transport.clone(), handle);

        match events.recv().await {
            Some(SchedulerEvent::Failed { id: failed, error }) => {
                assert_eq!(failed, id);
                assert!(matches!(error, ControllerError::WriteFailed { attempts: 1, .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_disconnect_flushes_and_reports_link_lost() {
        let transport = Arc::new(DryRunTransport::new("Hello Fairy", None));
        let handle = connected(&transport).await;
        transport.sever_writes();
        let (scheduler, mut events) = scheduler();

        let batch = scheduler.next_batch();
        let first = scheduler.enqueue(batch, vec![0x01], FrameKind::Mode);
        let second = scheduler.enqueue(batch, vec![0x02], FrameKind::Mode);
        scheduler.start(transport.clone(), handle);

        assert_eq!(
            events.recv().await,
            Some(SchedulerEvent::Failed {
                id: first,
                error: ControllerError::Disconnected
            })
        );
        assert_eq!(events.recv().await, Some(SchedulerEvent::Cancelled(second)));
        assert_eq!(events.recv().await, Some(SchedulerEvent::LinkLost));
        assert_eq!(scheduler.pending_len(), 0);
        tokio::task::yield_now().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_fails_in_flight_entry() {
        let transport = Arc::new(DryRunTransport::new("Hello Fairy", None).with_latency(Duration::from_millis(500)));
        let handle = connected(&transport).await;
        let (scheduler, mut events) = scheduler();

        let batch = scheduler.next_batch();
        let id = scheduler.enqueue(batch, vec![0x01], FrameKind::Mode);
        scheduler.start(transport.clone(), handle);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.in_flight(), Some(id));

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(
            events.recv().await,
            Some(SchedulerEvent::Failed {
                id,
                error: ControllerError::Disconnected
            })
        );
    }
}
