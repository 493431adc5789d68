//! In-memory Job record store, backed by atomic JSON persistence under
//! `<data_root>/jobs/<job_id>.json` (§6 "Persisted layout"). Read-shared,
//! write-exclusive per job: every mutation goes through `with_job_mut`,
//! which holds the map lock only long enough to clone the `Arc<Mutex<Job>>`
//! out, then locks just that job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use validation_common::model::{Job, JobId, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("io error persisting job record: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize job record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct JobStore {
    jobs_dir: PathBuf,
    jobs: Arc<Mutex<HashMap<JobId, Arc<Mutex<Job>>>>>,
}

impl JobStore {
    pub fn new(jobs_dir: PathBuf) -> Self {
        Self {
            jobs_dir,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Makes `job` visible to lookups immediately, satisfying the
    /// invariant "a Job is visible via lookup from the moment it is
    /// enqueued".
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.persist(&job)?;
        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(job.job_id, Arc::new(Mutex::new(job)));
        Ok(())
    }

    pub fn get(&self, job_id: JobId) -> Option<Job> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(&job_id).map(|slot| slot.lock().unwrap().clone())
    }

    pub fn active(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().unwrap();
        jobs.values()
            .map(|slot| slot.lock().unwrap().clone())
            .filter(|job| !job.status.is_terminal())
            .collect()
    }

    pub fn by_task(&self, task_id: &str) -> Vec<Job> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs
            .values()
            .map(|slot| slot.lock().unwrap().clone())
            .filter(|job| job.task_id == task_id)
            .collect();
        matching.sort_by_key(|job| job.sequence);
        matching
    }

    /// Applies `mutate` to the job under its own lock and re-persists it.
    /// The owning Worker is the only caller expected to mutate a given
    /// job, so the per-job lock is never contended in practice.
    pub fn with_job_mut(
        &self,
        job_id: JobId,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job, JobStoreError> {
        let slot = {
            let jobs = self.jobs.lock().unwrap();
            jobs.get(&job_id)
                .cloned()
                .ok_or(JobStoreError::UnknownJob(job_id))?
        };
        let snapshot = {
            let mut job = slot.lock().unwrap();
            mutate(&mut job);
            job.clone()
        };
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn persist(&self, job: &Job) -> Result<(), JobStoreError> {
        std::fs::create_dir_all(&self.jobs_dir)?;
        let final_path = self.jobs_dir.join(format!("{}.json", job.job_id));
        let staging_path = self.jobs_dir.join(format!("{}.json.tmp", job.job_id));
        let bytes = serde_json::to_vec_pretty(job)?;
        std::fs::write(&staging_path, bytes)?;
        std::fs::rename(&staging_path, &final_path)?;
        Ok(())
    }
}

pub fn job_path(jobs_dir: &Path, job_id: JobId) -> PathBuf {
    jobs_dir.join(format!("{}.json", job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use validation_common::invariant::TaskSpec;

    fn sample_job(sequence: u64) -> Job {
        Job {
            job_id: JobId::new(),
            task_id: "task-a".to_string(),
            status: JobStatus::Queued,
            sequence,
            enqueued_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            task_spec: TaskSpec {
                invariants: vec![],
                extra: Default::default(),
            },
            submission_path: PathBuf::from("/tmp/submission.zip"),
            log_path: PathBuf::from("/tmp/job.log"),
            result: None,
            log_tail: String::new(),
            tap_device: None,
            timeout_s: 120,
            net_checks: false,
            stream_log: false,
            quiet_kernel: false,
        }
    }

    #[test]
    fn inserted_job_is_immediately_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().to_path_buf());
        let job = sample_job(0);
        let job_id = job.job_id;
        store.insert(job).unwrap();
        assert!(store.get(job_id).is_some());
        assert!(dir.path().join(format!("{job_id}.json")).exists());
    }

    #[test]
    fn by_task_orders_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().to_path_buf());
        let mut second = sample_job(1);
        second.task_id = "task-a".to_string();
        let mut first = sample_job(0);
        first.task_id = "task-a".to_string();
        store.insert(second).unwrap();
        store.insert(first).unwrap();

        let jobs = store.by_task("task-a");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].sequence, 0);
        assert_eq!(jobs[1].sequence, 1);
    }

    #[test]
    fn mutating_unknown_job_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().to_path_buf());
        let result = store.with_job_mut(JobId::new(), |_| {});
        assert!(matches!(result, Err(JobStoreError::UnknownJob(_))));
    }

    #[test]
    fn active_excludes_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().to_path_buf());
        let mut done = sample_job(0);
        done.status = JobStatus::Done;
        let queued = sample_job(1);
        store.insert(done).unwrap();
        store.insert(queued).unwrap();

        assert_eq!(store.active().len(), 1);
    }
}
