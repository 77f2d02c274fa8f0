//! Bookkeeping of uploaded batches waiting to be fanned out.
//!
//! Every staged file carries a reference count: the number of outstanding
//! (job, receiver) deliveries that still need it. A file is deleted when its
//! count drops to zero, a job is dropped when its receiver set is empty. A
//! job registered with [`JobTable::register_batch`] owns the directory its
//! files were staged in, which goes away with the job. All of it happens
//! under one table-wide lock.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

/// One uploaded batch and the receivers that have not been served yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRelayJob {
    id: Uuid,
    source_host_name: String,
    receivers: BTreeSet<String>,
    files: BTreeSet<PathBuf>,
    batch_dir: Option<PathBuf>,
    created_at: DateTime<Utc>,
}

impl PendingRelayJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_host_name(&self) -> &str {
        &self.source_host_name
    }

    pub fn receivers(&self) -> &BTreeSet<String> {
        &self.receivers
    }

    pub fn files(&self) -> &BTreeSet<PathBuf> {
        &self.files
    }

    /// Directory holding this job's files alone, if any.
    pub fn batch_dir(&self) -> Option<&Path> {
        self.batch_dir.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Decides when a pending job is given up on. Expiring a job releases all of
/// its outstanding deliveries.
pub trait JobRetention: Send + Sync {
    fn is_expired(&self, job: &PendingRelayJob, now: DateTime<Utc>) -> bool;
}

/// Keeps every job until all of its receivers have been served.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetainForever;

impl JobRetention for RetainForever {
    fn is_expired(&self, _job: &PendingRelayJob, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Work handed to one fan-out connection.
///
/// While a claim is outstanding its (job, host) pairs are in flight and not
/// handed out again. Finish it with [`JobTable::complete`] or
/// [`JobTable::abandon`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Claim {
    host_name: String,
    jobs: Vec<Uuid>,
    files: Vec<PathBuf>,
}

impl Claim {
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn job_ids(&self) -> &[Uuid] {
        &self.jobs
    }

    /// Union of the files of every claimed job.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

#[derive(Default)]
struct TableState {
    jobs: HashMap<Uuid, PendingRelayJob>,
    ref_counts: HashMap<PathBuf, usize>,
    in_flight: HashSet<(Uuid, String)>,
}

impl TableState {
    /// Drops one reference to each of `files`, deleting those that reach
    /// zero. Returns the deleted paths.
    fn release<'a>(
        &mut self,
        files: impl IntoIterator<Item = &'a PathBuf>,
    ) -> Vec<PathBuf> {
        let mut released = Vec::new();
        for path in files {
            let Some(count) = self.ref_counts.get_mut(path) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ref_counts.remove(path);
                remove_staged_file(path);
                released.push(path.clone());
            }
        }
        released
    }
}

fn remove_staged_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Deleted staged file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Couldn't delete {}: {}", path.display(), e),
    }
}

/// Removes the batch directory of a job that is gone. Only succeeds once the
/// directory is empty.
fn remove_batch_dir(job: &PendingRelayJob) {
    let Some(dir) = &job.batch_dir else {
        return;
    };
    match fs::remove_dir(dir) {
        Ok(()) => debug!("Deleted batch directory {}", dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Couldn't delete {}: {}", dir.display(), e),
    }
}

/// Deletes a staged batch that never became a job.
pub(crate) fn discard_batch_dir(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!("Discarded batch directory {}", dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Couldn't delete {}: {}", dir.display(), e),
    }
}

#[derive(Default)]
pub struct JobTable {
    state: Mutex<TableState>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an upload. Returns `None`, creating nothing, when there is no
    /// receiver or no file.
    pub fn register<R, F>(
        &self,
        source_host_name: &str,
        receivers: R,
        files: F,
    ) -> Option<PendingRelayJob>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        F: IntoIterator<Item = PathBuf>,
    {
        self.insert(source_host_name, receivers, None, files)
    }

    /// Records an upload staged in `batch_dir`, a directory no other job
    /// uses. The directory is removed together with the job.
    pub fn register_batch<R, F>(
        &self,
        source_host_name: &str,
        receivers: R,
        batch_dir: PathBuf,
        files: F,
    ) -> Option<PendingRelayJob>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        F: IntoIterator<Item = PathBuf>,
    {
        self.insert(source_host_name, receivers, Some(batch_dir), files)
    }

    fn insert<R, F>(
        &self,
        source_host_name: &str,
        receivers: R,
        batch_dir: Option<PathBuf>,
        files: F,
    ) -> Option<PendingRelayJob>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        F: IntoIterator<Item = PathBuf>,
    {
        let receivers: BTreeSet<String> =
            receivers.into_iter().map(Into::into).collect();
        let files: BTreeSet<PathBuf> = files.into_iter().collect();
        if receivers.is_empty() || files.is_empty() {
            return None;
        }
        let job = PendingRelayJob {
            id: Uuid::new_v4(),
            source_host_name: source_host_name.to_string(),
            receivers,
            files,
            batch_dir,
            created_at: Utc::now(),
        };

        let mut state = self.state();
        for path in &job.files {
            *state.ref_counts.entry(path.clone()).or_default() +=
                job.receivers.len();
        }
        state.jobs.insert(job.id, job.clone());
        Some(job)
    }

    /// Takes every delivery pending for `host_name` that is not already in
    /// flight.
    pub fn claim(&self, host_name: &str) -> Option<Claim> {
        let mut state = self.state();
        let mut jobs: Vec<&PendingRelayJob> = state
            .jobs
            .values()
            .filter(|job| job.receivers.contains(host_name))
            .filter(|job| {
                !state.in_flight.contains(&(job.id, host_name.to_string()))
            })
            .collect();
        if jobs.is_empty() {
            return None;
        }
        jobs.sort_by_key(|job| job.created_at);
        let files: BTreeSet<PathBuf> =
            jobs.iter().flat_map(|job| job.files.iter().cloned()).collect();
        let claim = Claim {
            host_name: host_name.to_string(),
            jobs: jobs.iter().map(|job| job.id).collect(),
            files: files.into_iter().collect(),
        };
        for id in &claim.jobs {
            state.in_flight.insert((*id, claim.host_name.clone()));
        }
        Some(claim)
    }

    /// Marks the claimed deliveries as done. Returns the staged files that
    /// were deleted because nothing references them anymore.
    pub fn complete(&self, claim: Claim) -> Vec<PathBuf> {
        let mut state = self.state();
        let mut released = Vec::new();
        for id in &claim.jobs {
            if !state.in_flight.remove(&(*id, claim.host_name.clone())) {
                continue;
            }
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };
            if !job.receivers.remove(&claim.host_name) {
                continue;
            }
            let files: Vec<PathBuf> = job.files.iter().cloned().collect();
            let finished = if job.receivers.is_empty() {
                state.jobs.remove(id)
            } else {
                None
            };
            released.extend(state.release(&files));
            if let Some(job) = finished {
                remove_batch_dir(&job);
            }
        }
        released
    }

    /// Returns a failed claim's deliveries to the table.
    pub fn abandon(&self, claim: Claim) {
        let mut state = self.state();
        for id in &claim.jobs {
            state.in_flight.remove(&(*id, claim.host_name.clone()));
        }
    }

    /// Drops the jobs `retention` considers expired. Returns the staged files
    /// deleted as a result.
    pub fn sweep(
        &self,
        retention: &dyn JobRetention,
        now: DateTime<Utc>,
    ) -> Vec<PathBuf> {
        let mut state = self.state();
        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| retention.is_expired(job, now))
            .map(|job| job.id)
            .collect();
        let mut released = Vec::new();
        for id in expired {
            let Some(job) = state.jobs.remove(&id) else {
                continue;
            };
            debug!("Job {} from {} expired", id, job.source_host_name);
            state.in_flight.retain(|(job_id, _)| *job_id != id);
            for _ in &job.receivers {
                released.extend(state.release(&job.files));
            }
            remove_batch_dir(&job);
        }
        released
    }

    pub fn has_work_for(&self, host_name: &str) -> bool {
        self.state()
            .jobs
            .values()
            .any(|job| job.receivers.contains(host_name))
    }

    /// Outstanding deliveries referencing `path`.
    pub fn ref_count(&self, path: &Path) -> usize {
        self.state().ref_counts.get(path).copied().unwrap_or(0)
    }

    /// Snapshot of every pending job, oldest first.
    pub fn jobs(&self) -> Vec<PendingRelayJob> {
        let mut jobs: Vec<PendingRelayJob> =
            self.state().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, name).unwrap();
        path
    }

    fn serve(table: &JobTable, host: &str) -> Vec<PathBuf> {
        let claim = table.claim(host).expect("work for host");
        table.complete(claim)
    }

    #[test]
    fn each_receiver_is_served_once() {
        let dir = TempDir::new().unwrap();
        let f = staged(&dir, "f.txt");
        let g = staged(&dir, "g.txt");
        let table = JobTable::new();
        table
            .register("ann-pc", ["a", "b", "c"], [f.clone(), g.clone()])
            .unwrap();
        assert_eq!(table.ref_count(&f), 3);

        assert!(serve(&table, "a").is_empty());
        assert!(table.claim("a").is_none());
        assert!(serve(&table, "b").is_empty());
        assert_eq!(table.ref_count(&f), 1);

        let mut released = serve(&table, "c");
        released.sort();
        assert_eq!(released, vec![f.clone(), g.clone()]);
        assert!(table.is_empty());
        assert!(!f.exists());
        assert!(!g.exists());
    }

    #[test]
    fn shared_file_survives_until_every_job_releases_it() {
        let dir = TempDir::new().unwrap();
        let shared = staged(&dir, "shared.txt");
        let only_second = staged(&dir, "second.txt");
        let table = JobTable::new();
        table.register("ann-pc", ["bob-pc"], [shared.clone()]).unwrap();
        table
            .register(
                "cid-pc",
                ["dan-pc"],
                [shared.clone(), only_second.clone()],
            )
            .unwrap();
        assert_eq!(table.ref_count(&shared), 2);

        assert!(serve(&table, "bob-pc").is_empty());
        assert_eq!(table.len(), 1);
        assert!(shared.exists());

        let mut released = serve(&table, "dan-pc");
        released.sort();
        assert_eq!(released, vec![only_second.clone(), shared.clone()]);
        assert!(!shared.exists());
    }

    #[test]
    fn one_connection_serves_every_job_for_a_host() {
        let dir = TempDir::new().unwrap();
        let f = staged(&dir, "f.txt");
        let g = staged(&dir, "g.txt");
        let table = JobTable::new();
        table.register("ann-pc", ["bob-pc"], [f.clone()]).unwrap();
        table.register("cid-pc", ["bob-pc", "ann-pc"], [g.clone()]).unwrap();

        let claim = table.claim("bob-pc").unwrap();
        assert_eq!(claim.job_ids().len(), 2);
        assert_eq!(claim.files(), &[f.clone(), g.clone()]);

        assert_eq!(table.complete(claim), vec![f.clone()]);
        assert!(g.exists());
        assert!(table.has_work_for("ann-pc"));
        assert!(!table.has_work_for("bob-pc"));
    }

    #[test]
    fn in_flight_work_is_not_handed_out_twice() {
        let dir = TempDir::new().unwrap();
        let f = staged(&dir, "f.txt");
        let table = JobTable::new();
        table.register("ann-pc", ["bob-pc"], [f.clone()]).unwrap();

        let first = table.claim("bob-pc").unwrap();
        assert!(table.claim("bob-pc").is_none());

        table.abandon(first);
        assert_eq!(table.ref_count(&f), 1);
        let retry = table.claim("bob-pc").unwrap();
        assert_eq!(table.complete(retry), vec![f.clone()]);
    }

    #[test]
    fn later_job_is_not_released_by_an_earlier_claim() {
        let dir = TempDir::new().unwrap();
        let f = staged(&dir, "f.txt");
        let g = staged(&dir, "g.txt");
        let table = JobTable::new();
        table.register("ann-pc", ["bob-pc"], [f.clone()]).unwrap();

        let claim = table.claim("bob-pc").unwrap();
        table.register("ann-pc", ["bob-pc"], [g.clone()]).unwrap();
        table.complete(claim);

        assert!(table.has_work_for("bob-pc"));
        assert!(g.exists());
        assert_eq!(serve(&table, "bob-pc"), vec![g]);
    }

    #[test]
    fn nothing_to_deliver_creates_no_job() {
        let dir = TempDir::new().unwrap();
        let f = staged(&dir, "f.txt");
        let table = JobTable::new();

        assert!(
            table
                .register("ann-pc", Vec::<String>::new(), [f.clone()])
                .is_none()
        );
        assert!(table.register("ann-pc", ["bob-pc"], Vec::new()).is_none());
        assert!(table.is_empty());
        assert_eq!(table.ref_count(&f), 0);
        assert!(table.claim("bob-pc").is_none());
    }

    #[test]
    fn batch_dir_goes_away_with_its_job() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        for batch in [&first, &second] {
            fs::create_dir(batch).unwrap();
            fs::write(batch.join("a.txt"), batch.to_string_lossy().as_bytes())
                .unwrap();
        }
        let table = JobTable::new();
        let for_bob = table
            .register_batch(
                "ann-pc",
                ["bob-pc"],
                first.clone(),
                [first.join("a.txt")],
            )
            .unwrap();
        table
            .register_batch(
                "ann-pc",
                ["cy-pc"],
                second.clone(),
                [second.join("a.txt")],
            )
            .unwrap();
        assert_eq!(for_bob.batch_dir(), Some(first.as_path()));

        assert_eq!(serve(&table, "bob-pc"), vec![first.join("a.txt")]);
        assert!(!first.exists());
        assert_eq!(
            fs::read_to_string(second.join("a.txt")).unwrap(),
            second.to_string_lossy()
        );

        let expired = table.sweep(&ExpireFrom("ann-pc".into()), Utc::now());
        assert_eq!(expired, vec![second.join("a.txt")]);
        assert!(!second.exists());
        assert!(table.is_empty());
    }

    struct ExpireFrom(String);

    impl JobRetention for ExpireFrom {
        fn is_expired(
            &self,
            job: &PendingRelayJob,
            _now: DateTime<Utc>,
        ) -> bool {
            job.source_host_name() == self.0
        }
    }

    #[test]
    fn sweep_releases_expired_jobs_only() {
        let dir = TempDir::new().unwrap();
        let shared = staged(&dir, "shared.txt");
        let table = JobTable::new();
        table
            .register("ann-pc", ["bob-pc", "cid-pc"], [shared.clone()])
            .unwrap();
        table.register("dan-pc", ["bob-pc"], [shared.clone()]).unwrap();

        assert!(table.sweep(&RetainForever, Utc::now()).is_empty());
        assert_eq!(table.len(), 2);

        let claim = table.claim("cid-pc").unwrap();
        assert!(
            table
                .sweep(&ExpireFrom("ann-pc".into()), Utc::now())
                .is_empty()
        );
        assert_eq!(table.ref_count(&shared), 1);
        // The expired job's in-flight delivery no longer counts.
        assert!(table.complete(claim).is_empty());
        assert_eq!(table.ref_count(&shared), 1);

        let jobs = table.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_host_name(), "dan-pc");
    }
}
