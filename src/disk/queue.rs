//! The disk job queue and its worker pool.
//!
//! A fixed set of OS worker threads consumes a shared FIFO of ready jobs;
//! hash heavy jobs can be routed to a dedicated subset of hasher threads so
//! bulk checking never starves reads and writes. There is no cooperative
//! scheduler: workers block on the queue's condition variable, on file IO
//! and on the cache mutex, nothing else.
//!
//! # Fences
//!
//! Jobs that mutate a storage's layout (move, delete, rename, resume check,
//! stop) act as fences: a fence waits until every job of its storage that
//! was enqueued before it has completed, runs with the storage to itself,
//! and only then releases the jobs that queued up behind it, in their
//! original order. Distinct storages never wait on each other.
//!
//! Admission is decided at enqueue time: a job enqueued while its storage
//! has a fence pending or active goes to the storage's blocked list instead
//! of the ready queue, and is re-admitted (and thereby retried at the tail
//! of the ready queue) when the fence lowers.
//!
//! # Completions
//!
//! Workers don't call handlers themselves. Each completed job's alert is
//! appended to a shared completion queue under one brief lock, and a single
//! wakeup is sent when the queue goes from empty to non-empty; the disk
//! event loop drains it and dispatches on the network side's thread.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    alert::TorrentAlert,
    disk::job::Job,
    TorrentId,
};

/// Executes jobs on worker threads. Implemented by the disk context; split
/// into a trait so the queue knows nothing about storages and caches.
pub(crate) trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: Job);
}

#[derive(Default)]
struct StorageQueue {
    /// Jobs of this storage currently being executed by workers.
    outstanding: usize,
    /// Jobs of this storage sitting in the ready queues.
    queued: usize,
    fence: Fence,
    /// Jobs enqueued while a fence was pending or active; released in order
    /// when it lowers.
    blocked: VecDeque<Job>,
}

enum Fence {
    None,
    /// A fence job waiting for the storage's earlier jobs to drain.
    Pending(Job),
    /// The fence job is in the ready queue or executing; the storage
    /// belongs to it.
    Active,
}

impl Default for Fence {
    fn default() -> Self {
        Self::None
    }
}

impl Fence {
    fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

struct QueueState {
    ready: VecDeque<Job>,
    hash_ready: VecDeque<Job>,
    storages: HashMap<TorrentId, StorageQueue>,
    /// Jobs currently inside workers, across all storages.
    executing: usize,
    shutdown: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.executing == 0
            && self.ready.is_empty()
            && self.hash_ready.is_empty()
            && self.storages.values().all(|sq| {
                sq.blocked.is_empty() && sq.fence.is_none()
            })
    }
}

struct Shared {
    state: Mutex<QueueState>,
    ready_cv: Condvar,
    hash_cv: Condvar,
    idle_cv: Condvar,
    has_hashers: bool,
}

impl Shared {
    /// Routes an admitted job to the queue its worker class consumes.
    fn push_ready(&self, state: &mut QueueState, job: Job, front: bool) {
        let sq = state.storages.entry(job.torrent).or_default();
        sq.queued += 1;
        let to_hashers = self.has_hashers && job.is_hash_work();
        let queue = if to_hashers {
            &mut state.hash_ready
        } else {
            &mut state.ready
        };
        if front {
            queue.push_front(job);
        } else {
            queue.push_back(job);
        }
        if to_hashers {
            self.hash_cv.notify_one();
        } else {
            self.ready_cv.notify_one();
        }
    }

    /// Admission: decides between the ready queues, the blocked list, and
    /// parking a fence.
    fn enqueue(&self, state: &mut QueueState, job: Job) {
        enum Route {
            Ready,
            ParkFence,
            Block,
        }
        let route = {
            let sq = state.storages.entry(job.torrent).or_default();
            if job.is_fence() {
                match sq.fence {
                    Fence::None if sq.outstanding + sq.queued == 0 => {
                        sq.fence = Fence::Active;
                        Route::Ready
                    }
                    Fence::None => Route::ParkFence,
                    // chained fences queue up like everything else
                    _ => Route::Block,
                }
            } else if sq.fence.is_none() {
                Route::Ready
            } else {
                Route::Block
            }
        };
        match route {
            Route::Ready => self.push_ready(state, job, false),
            Route::ParkFence => {
                let sq = state.storages.get_mut(&job.torrent).unwrap();
                log::debug!(
                    "Storage {} fence pending behind {} job(s)",
                    job.torrent,
                    sq.outstanding + sq.queued
                );
                sq.fence = Fence::Pending(job);
            }
            Route::Block => {
                state
                    .storages
                    .get_mut(&job.torrent)
                    .unwrap()
                    .blocked
                    .push_back(job);
            }
        }
    }

    /// If the storage has a pending fence and nothing ahead of it anymore,
    /// moves the fence job to the front of the ready queue.
    fn maybe_promote_fence(
        &self,
        state: &mut QueueState,
        torrent: TorrentId,
    ) {
        let promoted = {
            let sq = state.storages.entry(torrent).or_default();
            if sq.outstanding + sq.queued == 0
                && matches!(sq.fence, Fence::Pending(_))
            {
                match std::mem::replace(&mut sq.fence, Fence::Active) {
                    Fence::Pending(job) => Some(job),
                    _ => unreachable!(),
                }
            } else {
                None
            }
        };
        if let Some(job) = promoted {
            log::debug!("Storage {} fence raised", torrent);
            self.push_ready(state, job, true);
        }
    }

    /// Registers the completion of a job: lowers its fence if it was one,
    /// re-admits blocked jobs, and promotes a pending fence.
    fn complete(&self, torrent: TorrentId, was_fence: bool) {
        let mut state = self.state.lock().unwrap();
        state.executing -= 1;
        {
            let sq = state.storages.entry(torrent).or_default();
            sq.outstanding -= 1;
        }

        if was_fence {
            let blocked = {
                let sq = state.storages.entry(torrent).or_default();
                debug_assert!(matches!(sq.fence, Fence::Active));
                sq.fence = Fence::None;
                std::mem::take(&mut sq.blocked)
            };
            if !blocked.is_empty() {
                log::debug!(
                    "Storage {} fence lowered, releasing {} job(s)",
                    torrent,
                    blocked.len()
                );
            }
            for job in blocked {
                self.enqueue(&mut state, job);
            }
        }

        self.maybe_promote_fence(&mut state, torrent);
        if state.is_idle() {
            self.idle_cv.notify_all();
        }
    }

    fn worker_loop(self: Arc<Self>, runner: Arc<dyn JobRunner>, hasher: bool) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let popped = if hasher {
                        state.hash_ready.pop_front()
                    } else {
                        state.ready.pop_front()
                    };
                    if let Some(job) = popped {
                        state.executing += 1;
                        let sq = state
                            .storages
                            .entry(job.torrent)
                            .or_default();
                        sq.queued -= 1;
                        sq.outstanding += 1;
                        break job;
                    }
                    let cv = if hasher {
                        &self.hash_cv
                    } else {
                        &self.ready_cv
                    };
                    state = cv.wait(state).unwrap();
                }
            };

            let torrent = job.torrent;
            let was_fence = job.is_fence();
            log::trace!("Worker executing {} job", job.name());
            runner.run(job);
            self.complete(torrent, was_fence);
        }
    }
}

/// The handle to the queue; cheap to clone.
#[derive(Clone)]
pub(crate) struct JobQueue {
    shared: Arc<Shared>,
    threads: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl JobQueue {
    /// Spawns the worker and hasher threads.
    pub fn new(
        runner: Arc<dyn JobRunner>,
        worker_threads: usize,
        hashing_threads: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                hash_ready: VecDeque::new(),
                storages: HashMap::new(),
                executing: 0,
                shutdown: false,
            }),
            ready_cv: Condvar::new(),
            hash_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            has_hashers: hashing_threads > 0,
        });

        let mut threads = Vec::new();
        for i in 0..worker_threads.max(1) {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("disk-worker-{}", i))
                    .spawn(move || shared.worker_loop(runner, false))
                    .expect("failed to spawn disk worker"),
            );
        }
        for i in 0..hashing_threads {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("disk-hasher-{}", i))
                    .spawn(move || shared.worker_loop(runner, true))
                    .expect("failed to spawn disk hasher"),
            );
        }

        Self {
            shared,
            threads: Arc::new(Mutex::new(threads)),
        }
    }

    pub fn enqueue(&self, job: Job) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        self.shared.enqueue(&mut state, job);
    }

    /// Pulls every queued (not yet executing) job of the torrent out of the
    /// queue, including a parked fence, and returns them so the caller can
    /// fail them. In-flight jobs are left to finish.
    pub fn abort_jobs(&self, torrent: TorrentId) -> Vec<Job> {
        let mut state = self.shared.state.lock().unwrap();
        let state = &mut *state;
        let mut aborted = Vec::new();

        // a fence job found in the ready queues is the storage's admitted
        // (active) fence; removing it must lower the fence or the storage
        // would stay blocked forever
        let mut removed_active_fence = false;
        for queue in [&mut state.ready, &mut state.hash_ready].iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(job) = queue.pop_front() {
                if job.torrent == torrent {
                    removed_active_fence |= job.is_fence();
                    aborted.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            **queue = kept;
        }

        if let Some(sq) = state.storages.get_mut(&torrent) {
            sq.queued -= aborted.len();
            aborted.extend(sq.blocked.drain(..));
            match std::mem::replace(&mut sq.fence, Fence::None) {
                Fence::Pending(job) => aborted.push(job),
                Fence::Active if removed_active_fence => {}
                other => sq.fence = other,
            }
        }
        log::debug!(
            "Aborted {} queued job(s) of torrent {}",
            aborted.len(),
            torrent
        );
        aborted
    }

    /// Blocks until no job is queued or executing, or the timeout passes.
    /// Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        while !state.is_idle() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (s, _) = self
                .shared
                .idle_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = s;
        }
        true
    }

    /// Stops the workers. Queued jobs are dropped; in-flight jobs finish.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.ready.clear();
            state.hash_ready.clear();
        }
        self.shared.ready_cv.notify_all();
        self.shared.hash_cv.notify_all();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One completed job's alert, on its way to the network side.
#[derive(Debug)]
pub(crate) enum Completion {
    Torrent(TorrentId, TorrentAlert),
    Engine(crate::alert::Alert),
}

/// The batched completion queue between workers and the disk event loop.
pub(crate) struct CompletionQueue {
    queue: Mutex<Vec<Completion>>,
    /// One unit is sent whenever the queue transitions from empty to
    /// non-empty; the event loop drains on receipt.
    wake: mpsc::UnboundedSender<()>,
}

impl CompletionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (wake, wake_port) = mpsc::unbounded_channel();
        (
            Self {
                queue: Mutex::new(Vec::new()),
                wake,
            },
            wake_port,
        )
    }

    /// Appends a worker's local batch, waking the dispatcher only on the
    /// empty to non-empty transition.
    pub fn post(&self, completions: Vec<Completion>) {
        if completions.is_empty() {
            return;
        }
        let was_empty = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(completions);
            was_empty
        };
        if was_empty {
            // the event loop may already be gone during shutdown
            let _ = self.wake.send(());
        }
    }

    pub fn drain(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::job::JobKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records execution order and watches fence exclusivity.
    struct Recorder {
        log: Mutex<Vec<(TorrentId, &'static str)>>,
        running: AtomicUsize,
        fence_overlap: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                fence_overlap: AtomicUsize::new(0),
            })
        }

        fn names(&self, torrent: TorrentId) -> Vec<&'static str> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == torrent)
                .map(|(_, name)| *name)
                .collect()
        }
    }

    impl JobRunner for Recorder {
        fn run(&self, job: Job) {
            let concurrent =
                self.running.fetch_add(1, Ordering::SeqCst) + 1;
            if job.is_fence() && concurrent > 1 {
                // another job of the (single) test storage was in flight
                // while a fence executed
                self.fence_overlap.fetch_add(1, Ordering::SeqCst);
            }
            self.log.lock().unwrap().push((job.torrent, job.name()));
            std::thread::sleep(Duration::from_millis(5));
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn read_job(torrent: TorrentId) -> Job {
        Job {
            torrent,
            kind: JobKind::Read {
                info: crate::BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: crate::BLOCK_LEN,
                },
            },
        }
    }

    fn fence_job(torrent: TorrentId) -> Job {
        Job {
            torrent,
            kind: JobKind::ReleaseFiles,
        }
    }

    #[test]
    fn test_jobs_execute_and_drain() {
        let recorder = Recorder::new();
        let queue = JobQueue::new(recorder.clone(), 2, 0);
        for _ in 0..4 {
            queue.enqueue(read_job(0));
        }
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(recorder.names(0).len(), 4);
        queue.shutdown();
    }

    #[test]
    fn test_fence_orders_and_excludes() {
        let recorder = Recorder::new();
        let queue = JobQueue::new(recorder.clone(), 4, 0);
        // job, fence, job: the fence must run after the first and before
        // the second, alone
        queue.enqueue(read_job(0));
        queue.enqueue(fence_job(0));
        queue.enqueue(read_job(0));
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(
            recorder.names(0),
            vec!["read", "release_files", "read"]
        );
        assert_eq!(recorder.fence_overlap.load(Ordering::SeqCst), 0);
        queue.shutdown();
    }

    #[test]
    fn test_fence_does_not_block_other_storage() {
        let recorder = Recorder::new();
        let queue = JobQueue::new(recorder.clone(), 4, 0);
        queue.enqueue(read_job(0));
        queue.enqueue(fence_job(0));
        queue.enqueue(read_job(0));
        for _ in 0..4 {
            queue.enqueue(read_job(1));
        }
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(recorder.names(1).len(), 4);
        assert_eq!(
            recorder.names(0),
            vec!["read", "release_files", "read"]
        );
        queue.shutdown();
    }

    #[test]
    fn test_chained_fences() {
        let recorder = Recorder::new();
        let queue = JobQueue::new(recorder.clone(), 4, 0);
        queue.enqueue(fence_job(0));
        queue.enqueue(fence_job(0));
        queue.enqueue(read_job(0));
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(
            recorder.names(0),
            vec!["release_files", "release_files", "read"]
        );
        assert_eq!(recorder.fence_overlap.load(Ordering::SeqCst), 0);
        queue.shutdown();
    }

    #[test]
    fn test_abort_drains_queued_jobs() {
        let recorder = Recorder::new();
        // a single worker so the jobs stay queued while the first executes
        let queue = JobQueue::new(recorder.clone(), 1, 0);
        queue.enqueue(read_job(0));
        queue.enqueue(read_job(0));
        queue.enqueue(read_job(0));
        let aborted = queue.abort_jobs(0);
        // at least the jobs that had not been popped yet came back
        assert!(aborted.len() >= 2);
        assert!(queue.wait_idle(Duration::from_secs(5)));
        queue.shutdown();
    }

    #[test]
    fn test_hash_jobs_route_to_hashers() {
        let recorder = Recorder::new();
        let queue = JobQueue::new(recorder.clone(), 1, 1);
        queue.enqueue(Job {
            torrent: 0,
            kind: JobKind::Hash { piece: 0 },
        });
        queue.enqueue(read_job(0));
        assert!(queue.wait_idle(Duration::from_secs(5)));
        let names = recorder.names(0);
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"hash"));
        queue.shutdown();
    }

    #[test]
    fn test_completion_queue_single_wakeup() {
        let (queue, mut wake) = CompletionQueue::new();
        queue.post(vec![Completion::Torrent(
            0,
            TorrentAlert::FilesReleased,
        )]);
        queue.post(vec![Completion::Torrent(
            0,
            TorrentAlert::FilesReleased,
        )]);
        // one wakeup for the empty -> non-empty transition only
        assert!(wake.try_recv().is_ok());
        assert!(wake.try_recv().is_err());
        assert_eq!(queue.drain().len(), 2);
        // next post wakes again
        queue.post(vec![Completion::Torrent(
            0,
            TorrentAlert::FilesReleased,
        )]);
        assert!(wake.try_recv().is_ok());
    }
}
