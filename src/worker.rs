//! Running-job registry for the status page: one entry per backup
//! currently executing, so an admin query can list progress without
//! reaching into the scheduler's internals. Modernized from
//! `WorkerTask`/`WORKER_TASK_LIST` (`server/worker_task.rs`):
//! same "global map keyed by an incrementing id, `Arc` handle carries an
//! abort flag and a progress float" shape, but built on `std::thread`
//! and `log` instead of tokio 0.1 and `failure`, matching the rest of
//! this workspace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use ub_api_types::{BackupKind, TGroup};

lazy_static! {
    static ref JOB_REGISTRY: Mutex<HashMap<usize, Arc<JobHandle>>> = Mutex::new(HashMap::new());
}

static NEXT_JOB_ID: AtomicUsize = AtomicUsize::new(1);

/// Snapshot of one running job, for status reporting.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: usize,
    pub client_id: i64,
    pub kind: BackupKind,
    pub tgroup: TGroup,
    pub started_at: i64,
    pub progress: f64,
    pub abort_requested: bool,
}

struct JobData {
    progress: f64,
}

pub struct JobHandle {
    job_id: usize,
    client_id: i64,
    kind: BackupKind,
    tgroup: TGroup,
    started_at: i64,
    data: Mutex<JobData>,
    abort_requested: AtomicBool,
}

impl JobHandle {
    fn new(job_id: usize, client_id: i64, kind: BackupKind, tgroup: TGroup, started_at: i64) -> Arc<Self> {
        Arc::new(JobHandle {
            job_id,
            client_id,
            kind,
            tgroup,
            started_at,
            data: Mutex::new(JobData { progress: 0.0 }),
            abort_requested: AtomicBool::new(false),
        })
    }

    pub fn job_id(&self) -> usize {
        self.job_id
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn set_progress(&self, progress: f64) {
        if (0.0..=1.0).contains(&progress) {
            self.data.lock().unwrap().progress = progress;
        } else {
            log::warn!("job {}: ignoring out-of-range progress {progress}", self.job_id);
        }
    }

    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.job_id,
            client_id: self.client_id,
            kind: self.kind,
            tgroup: self.tgroup,
            started_at: self.started_at,
            progress: self.data.lock().unwrap().progress,
            abort_requested: self.abort_requested(),
        }
    }
}

/// Registers a job and runs `f` on a dedicated thread, deregistering it
/// once `f` returns. Mirrors `WorkerTask::new_thread`'s register/spawn/
/// deregister sequence.
pub fn spawn<F>(client_id: i64, kind: BackupKind, tgroup: TGroup, started_at: i64, f: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce(Arc<JobHandle>) + Send + 'static,
{
    let job_id = NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst);
    let handle = JobHandle::new(job_id, client_id, kind, tgroup, started_at);
    JOB_REGISTRY.lock().unwrap().insert(job_id, handle.clone());

    std::thread::spawn(move || {
        f(handle);
        JOB_REGISTRY.lock().unwrap().remove(&job_id);
    })
}

/// All jobs currently registered, for the status page.
pub fn running_jobs() -> Vec<JobInfo> {
    JOB_REGISTRY.lock().unwrap().values().map(|h| h.info()).collect()
}

/// Count of running jobs for one client, used by the `max_running_jobs_per_client`
/// admission check.
pub fn running_jobs_for_client(client_id: i64) -> u32 {
    JOB_REGISTRY
        .lock()
        .unwrap()
        .values()
        .filter(|h| h.client_id == client_id)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawn_registers_and_deregisters() {
        let (proceed_tx, proceed_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        let handle = spawn(1, BackupKind::IncrFile, 0, 1000, move |job| {
            job.set_progress(0.5);
            started_tx.send(()).unwrap();
            proceed_rx.recv().unwrap();
        });

        // Blocks until the job thread has registered itself and reported in.
        started_rx.recv().unwrap();
        assert!(running_jobs().iter().any(|j| j.client_id == 1));
        assert_eq!(running_jobs_for_client(1), 1);

        proceed_tx.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(running_jobs_for_client(1), 0);
    }
}
