//! In-memory registry used by tests and local experiments.
//!
//! Transactions take a single writer lock for their whole lifetime and work on
//! a staged copy of the tables, so a transaction's writes become visible only
//! on commit. Faults can be switched on to exercise failure paths.

use super::{
    BlobRegistry, Insert, Lookup, RegistryError, RegistryResult, RegistryTx,
    UploadSessionTracker,
};
use crate::models::{
    blob::{Blob, BlobStatus, NewBlob, ProjectBlob},
    project::Project,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::OwnedMutexGuard;

#[derive(Default, Clone)]
struct Tables {
    blobs: BTreeMap<String, Blob>,
    projects: BTreeMap<String, Project>,
    project_blobs: BTreeMap<(i64, i64), ProjectBlob>,
    sessions: HashMap<String, i64>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct Faults {
    lookups: AtomicBool,
    sessions: AtomicBool,
    associate: AtomicBool,
}

#[derive(Default)]
struct Counters {
    transactions: AtomicUsize,
    writes: AtomicUsize,
    session_lookups: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    tables: Arc<Mutex<Tables>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_lookups(&self) -> RegistryResult<()> {
        check(&self.faults.lookups, "lookup")
    }

    /// Overwrite a blob's status the way the garbage collector would.
    pub async fn set_blob_status(&self, digest: &str, status: BlobStatus) {
        let _writer = self.writer.lock().await;
        if let Some(blob) = self.tables().blobs.get_mut(digest) {
            blob.status = status;
            blob.updated_at = Utc::now();
        }
    }

    /// Seed a blob row directly, bypassing the finalizer.
    pub async fn seed_blob(&self, digest: &str, size: i64, status: BlobStatus) -> Blob {
        let _writer = self.writer.lock().await;
        let mut tables = self.tables();
        let now = Utc::now();
        let blob = Blob {
            id: tables.next_id(),
            digest: digest.to_string(),
            content_type: crate::models::blob::DEFAULT_MEDIA_TYPE.to_string(),
            size,
            status,
            created_at: now,
            updated_at: now,
        };
        tables.blobs.insert(digest.to_string(), blob.clone());
        blob
    }

    /// Record the accepted byte count of an upload session.
    pub fn set_accepted_size(&self, session_id: &str, size: i64) {
        self.tables().sessions.insert(session_id.to_string(), size);
    }

    pub fn fail_lookups(&self, on: bool) {
        self.faults.lookups.store(on, Ordering::SeqCst);
    }

    pub fn fail_sessions(&self, on: bool) {
        self.faults.sessions.store(on, Ordering::SeqCst);
    }

    pub fn fail_associate(&self, on: bool) {
        self.faults.associate.store(on, Ordering::SeqCst);
    }

    pub fn blob_count(&self) -> usize {
        self.tables().blobs.len()
    }

    pub fn association_count(&self) -> usize {
        self.tables().project_blobs.len()
    }

    /// Transactions opened so far.
    pub fn transactions(&self) -> usize {
        self.counters.transactions.load(Ordering::SeqCst)
    }

    /// Row writes staged by transactions, committed or not.
    pub fn writes(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }

    pub fn session_lookups(&self) -> usize {
        self.counters.session_lookups.load(Ordering::SeqCst)
    }
}

fn check(flag: &AtomicBool, what: &str) -> RegistryResult<()> {
    if flag.load(Ordering::SeqCst) {
        Err(RegistryError::Unavailable(format!("injected {what} failure")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl BlobRegistry for MemoryRegistry {
    async fn blob(&self, digest: &str) -> RegistryResult<Lookup<Blob>> {
        self.check_lookups()?;
        Ok(self
            .tables()
            .blobs
            .get(digest)
            .cloned()
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn project_by_name(&self, name: &str) -> RegistryResult<Lookup<Project>> {
        self.check_lookups()?;
        Ok(self
            .tables()
            .projects
            .get(name)
            .cloned()
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn create_project(&self, name: &str) -> RegistryResult<Insert<Project>> {
        let _writer = self.writer.lock().await;
        let mut tables = self.tables();
        if tables.projects.contains_key(name) {
            return Ok(Insert::Conflict);
        }
        let project = Project {
            id: tables.next_id(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        tables.projects.insert(name.to_string(), project.clone());
        Ok(Insert::Inserted(project))
    }

    async fn project_blobs(&self, project_id: i64) -> RegistryResult<Vec<Blob>> {
        self.check_lookups()?;
        let tables = self.tables();
        Ok(tables
            .blobs
            .values()
            .filter(|blob| tables.project_blobs.contains_key(&(project_id, blob.id)))
            .cloned()
            .collect())
    }

    async fn begin(&self) -> RegistryResult<Box<dyn RegistryTx>> {
        let writer = self.writer.clone().lock_owned().await;
        self.counters.transactions.fetch_add(1, Ordering::SeqCst);
        let staged = self.tables().clone();
        Ok(Box::new(MemoryTx {
            _writer: writer,
            staged,
            shared: self.tables.clone(),
            faults: self.faults.clone(),
            counters: self.counters.clone(),
        }))
    }
}

#[async_trait]
impl UploadSessionTracker for MemoryRegistry {
    async fn accepted_size(&self, session_id: &str) -> RegistryResult<Lookup<i64>> {
        self.counters.session_lookups.fetch_add(1, Ordering::SeqCst);
        check(&self.faults.sessions, "session lookup")?;
        Ok(self
            .tables()
            .sessions
            .get(session_id)
            .copied()
            .map_or(Lookup::NotFound, Lookup::Found))
    }
}

pub struct MemoryTx {
    _writer: OwnedMutexGuard<()>,
    staged: Tables,
    shared: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
}

impl MemoryTx {
    fn wrote(&self) {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryTx for MemoryTx {
    async fn blob(&mut self, digest: &str) -> RegistryResult<Lookup<Blob>> {
        check(&self.faults.lookups, "lookup")?;
        Ok(self
            .staged
            .blobs
            .get(digest)
            .cloned()
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn insert_blob(&mut self, blob: &NewBlob) -> RegistryResult<Insert<Blob>> {
        if self.staged.blobs.contains_key(&blob.digest) {
            return Ok(Insert::Conflict);
        }
        let now = Utc::now();
        let row = Blob {
            id: self.staged.next_id(),
            digest: blob.digest.clone(),
            content_type: blob.content_type.clone(),
            size: blob.size,
            status: blob.status,
            created_at: now,
            updated_at: now,
        };
        self.staged.blobs.insert(blob.digest.clone(), row.clone());
        self.wrote();
        Ok(Insert::Inserted(row))
    }

    async fn mark_blob_success(&mut self, blob_id: i64) -> RegistryResult<()> {
        let pending = self.staged.blobs.values_mut().find(|blob| {
            blob.id == blob_id && matches!(blob.status, BlobStatus::None | BlobStatus::Pending)
        });
        if let Some(blob) = pending {
            blob.status = BlobStatus::Success;
            blob.updated_at = Utc::now();
            self.wrote();
        }
        Ok(())
    }

    async fn associate(
        &mut self,
        project_id: i64,
        blob_id: i64,
    ) -> RegistryResult<Insert<ProjectBlob>> {
        check(&self.faults.associate, "associate")?;
        if self.staged.project_blobs.contains_key(&(project_id, blob_id)) {
            return Ok(Insert::Conflict);
        }
        let link = ProjectBlob {
            id: self.staged.next_id(),
            project_id,
            blob_id,
            created_at: Utc::now(),
        };
        self.staged
            .project_blobs
            .insert((project_id, blob_id), link.clone());
        self.wrote();
        Ok(Insert::Inserted(link))
    }

    async fn commit(self: Box<Self>) -> RegistryResult<()> {
        let MemoryTx { staged, shared, .. } = *self;
        let mut tables = shared.lock().unwrap_or_else(PoisonError::into_inner);
        tables.blobs = staged.blobs;
        tables.project_blobs = staged.project_blobs;
        tables.next_id = tables.next_id.max(staged.next_id);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RegistryResult<()> {
        Ok(())
    }
}
