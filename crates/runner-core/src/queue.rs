use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::watch;

use crate::model::{Stage, Task};

/// Waiting/in-flight counts per stage, broadcast on every mutation (spec
/// §4.7 "Every mutation emits an `updated` event"). Grounded on the
/// teacher's `watch::Receiver<StatusSnapshot>` (`engine.rs`), reused here
/// for the queue's own occupancy rather than worker progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub waiting: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub download: StageCounts,
    pub convert: StageCounts,
    pub upload: StageCounts,
}

struct StageState {
    waiting: VecDeque<Task>,
    in_flight: HashSet<String>,
    cap: usize,
}

impl StageState {
    fn new(cap: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            in_flight: HashSet::new(),
            cap,
        }
    }

    fn counts(&self) -> StageCounts {
        StageCounts {
            waiting: self.waiting.len(),
            in_flight: self.in_flight.len(),
        }
    }

    /// Inserts at the tail of the priority class it belongs to: a stable
    /// sort by descending priority with arrival order as the tie-break
    /// (spec §4.7 "Priority tie-break: arrival order").
    fn enqueue(&mut self, task: Task) {
        let insert_at = self
            .waiting
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(insert_at, task);
    }

    /// Pops the head of the waiting list iff there is spare in-flight
    /// capacity.
    fn pop_if_capacity(&mut self) -> Option<Task> {
        if self.in_flight.len() >= self.cap {
            return None;
        }
        let task = self.waiting.pop_front()?;
        self.in_flight.insert(task.id.clone());
        Some(task)
    }
}

/// Three independent FIFO-by-priority queues (C8): `downloadQ`, `convertQ`,
/// `uploadQ`, each with its own concurrency cap. Grounded on the teacher's
/// `EngineRuntime` (`engine.rs`): a `pending` deque plus a fixed worker-slot
/// cap, generalized here to three independently-capped stages instead of
/// one flat pool.
pub struct TaskQueue {
    download: StageState,
    convert: StageState,
    upload: StageState,
    /// Tracks which stage (if any) currently holds a given task id, so
    /// `add` can enforce invariant 1 ("a task id appears in at most one
    /// stage queue at any time").
    location: HashMap<String, Stage>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
}

impl TaskQueue {
    pub fn new(download_cap: usize, convert_cap: usize, upload_cap: usize) -> Self {
        let (snapshot_tx, _) = watch::channel(QueueSnapshot::default());
        Self {
            download: StageState::new(download_cap),
            convert: StageState::new(convert_cap),
            upload: StageState::new(upload_cap),
            location: HashMap::new(),
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(QueueSnapshot {
            download: self.download.counts(),
            convert: self.convert.counts(),
            upload: self.upload.counts(),
        });
    }

    /// Inserts into `downloadQ` iff the task id is in no stage.
    pub fn add(&mut self, task: Task) {
        if self.location.contains_key(&task.id) {
            tracing::warn!(task_id = %task.id, "ignoring add for task already in a stage queue");
            return;
        }
        self.location.insert(task.id.clone(), Stage::Download);
        self.download.enqueue(task);
        self.publish();
    }

    pub fn next_download(&mut self) -> Option<Task> {
        let task = self.download.pop_if_capacity();
        if task.is_some() {
            self.publish();
        }
        task
    }

    pub fn next_convert(&mut self) -> Option<Task> {
        let task = self.convert.pop_if_capacity();
        if task.is_some() {
            self.publish();
        }
        task
    }

    pub fn next_upload(&mut self) -> Option<Task> {
        let task = self.upload.pop_if_capacity();
        if task.is_some() {
            self.publish();
        }
        task
    }

    /// Atomically removes from the source stage's in-flight set and
    /// enqueues at the tail of the next stage's waiting list.
    pub fn complete_download(&mut self, task: Task) {
        self.download.in_flight.remove(&task.id);
        self.location.insert(task.id.clone(), Stage::Convert);
        self.convert.enqueue(task);
        self.publish();
    }

    pub fn complete_convert(&mut self, task: Task) {
        self.convert.in_flight.remove(&task.id);
        self.location.insert(task.id.clone(), Stage::Upload);
        self.upload.enqueue(task);
        self.publish();
    }

    /// Removes from upload in-flight; the caller is responsible for the
    /// terminal completion event (posting `complete` to the control
    /// plane), this only clears queue occupancy.
    pub fn complete_upload(&mut self, task_id: &str) {
        self.upload.in_flight.remove(task_id);
        self.location.remove(task_id);
        self.publish();
    }

    /// Removes the task from the given stage's in-flight set. The caller
    /// is responsible for the terminal failure event.
    pub fn fail(&mut self, task_id: &str, stage: Stage) {
        match stage {
            Stage::Download => self.download.in_flight.remove(task_id),
            Stage::Convert => self.convert.in_flight.remove(task_id),
            Stage::Upload => self.upload.in_flight.remove(task_id),
        };
        self.location.remove(task_id);
        self.publish();
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            download: self.download.counts(),
            convert: self.convert.counts(),
            upload: self.upload.counts(),
        }
    }

    pub fn download_has_capacity(&self) -> bool {
        self.download.in_flight.len() < self.download.cap
    }
}
