//! Inserting a whole manifest as one container block.
//!
//! [`ContainerInserter`] composes the manifest's descriptor tree, splits it
//! until it encodes, packs every entry into a single archive bucket and
//! hands that bucket to a block-insertion engine. The job's callback hears
//! exactly once from it: a transition to the engine's job, a failure, or a
//! cancellation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

use crate::archive::{self, ArchiveType, ContainerEntry};
use crate::bucket::{Bucket, BucketFactory, BucketRef};
use crate::client::{
    BlockInsertOptions, BlockInserter, ClientContext, ClientPutter, InsertBlock, JobId, PutCompletion, PutState,
    Token,
};
use crate::compose::compose;
use crate::error::InsertError;
use crate::manifest::Directory;
use crate::metadata::{EncodeLimits, MetadataArena, MAX_INLINE_LIMIT};
use crate::resolve::{is_reserved_name, resolve, ResolveReport};

/// Client-wide insertion settings, usually read from a JSON file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertContext {
    /// Largest child descriptor a composite may embed inline.
    pub max_inline_metadata_bytes: usize,
    pub archive_type: ArchiveType,
    pub dont_compress: bool,
    pub realtime: bool,
    /// Directory for temporary buckets; the system default when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for InsertContext {
    fn default() -> Self {
        Self {
            max_inline_metadata_bytes: EncodeLimits::default().max_inline_bytes(),
            archive_type: ArchiveType::Tar,
            dont_compress: false,
            realtime: false,
            temp_dir: None,
        }
    }
}

impl InsertContext {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let cfg: Self = serde_json::from_reader(f).with_context(|| format!("parse config {:?}", path))?;
        if cfg.max_inline_metadata_bytes > MAX_INLINE_LIMIT {
            debug!(
                requested = cfg.max_inline_metadata_bytes,
                max = MAX_INLINE_LIMIT,
                "clamping inline metadata limit"
            );
        }
        Ok(cfg)
    }

    pub fn limits(&self) -> EncodeLimits {
        EncodeLimits::new(self.max_inline_metadata_bytes)
    }

    /// Per-job options seeded from these settings.
    pub fn default_options(&self) -> InsertOptions {
        InsertOptions { dont_compress: self.dont_compress, realtime: self.realtime, ..InsertOptions::default() }
    }
}

/// Flags for one insertion job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertOptions {
    pub persistent: bool,
    pub get_chk_only: bool,
    pub early_encode: bool,
    pub report_metadata_only: bool,
    pub dont_compress: bool,
    pub realtime: bool,
    pub force_crypto_key: Option<[u8; 32]>,
    pub crypto_algorithm: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    MetadataBuilt,
    ArchiveBuilt,
    Delegated,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

struct JobFlags {
    cancelled: bool,
    finished: bool,
    state: JobState,
}

/// Compose and resolve `manifest`, returning every container entry with the
/// root descriptor last.
pub fn build_entries(
    manifest: &Directory,
    limits: EncodeLimits,
    buckets: &dyn BucketFactory,
) -> Result<(Vec<ContainerEntry>, ResolveReport)> {
    if let Some((name, _)) = manifest.iter().find(|(name, _)| is_reserved_name(name)) {
        bail!("top-level name {:?} is reserved for container metadata", name);
    }
    let mut arena = MetadataArena::new();
    let mut entries = Vec::with_capacity(manifest.embedded_count() + 1);
    let root = compose(manifest, &mut arena, &mut entries);
    let report = resolve(&mut arena, root, limits, buckets, &mut entries)?;
    debug!(
        entries = entries.len(),
        aux = report.aux_entries,
        attempts = report.attempts,
        "container entries ready"
    );
    Ok((entries, report))
}

/// Pack `entries` into a new bucket. The bucket is discarded on failure.
pub fn pack_to_bucket(
    entries: &[ContainerEntry],
    format: ArchiveType,
    buckets: &dyn BucketFactory,
) -> Result<(BucketRef, &'static str)> {
    let mut out = buckets.make_bucket(None).context("allocate container bucket")?;
    let content_type = archive::pack(entries, format, &mut out)?;
    let bucket = out.finish().context("seal container bucket")?;
    Ok((bucket, content_type))
}

/// Job inserting a manifest as a single archive.
pub struct ContainerInserter {
    id: JobId,
    parent: Arc<ClientPutter>,
    cb: Arc<dyn PutCompletion>,
    manifest: Directory,
    archive_type: ArchiveType,
    target_uri: Option<String>,
    limits: EncodeLimits,
    options: InsertOptions,
    engine: Arc<dyn BlockInserter>,
    token: Option<Token>,
    flags: Mutex<JobFlags>,
}

impl ContainerInserter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent: Arc<ClientPutter>,
        cb: Arc<dyn PutCompletion>,
        manifest: Directory,
        target_uri: Option<String>,
        config: &InsertContext,
        options: InsertOptions,
        engine: Arc<dyn BlockInserter>,
        token: Option<Token>,
    ) -> Self {
        Self {
            id: JobId::next(),
            parent,
            cb,
            manifest,
            archive_type: config.archive_type,
            target_uri,
            limits: config.limits(),
            options,
            engine,
            token,
            flags: Mutex::new(JobFlags { cancelled: false, finished: false, state: JobState::Pending }),
        }
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn archive_type(&self) -> ArchiveType {
        self.archive_type
    }

    /// Options handed to the block-insertion engine. ZIP compresses its own
    /// entries, so the engine is told not to compress again.
    pub fn block_options(&self) -> BlockInsertOptions {
        let o = &self.options;
        BlockInsertOptions {
            dont_compress: o.dont_compress || self.archive_type.compresses(),
            get_chk_only: o.get_chk_only,
            report_metadata_only: o.report_metadata_only,
            early_encode: o.early_encode,
            persistent: o.persistent,
            realtime: o.realtime,
            force_crypto_key: o.force_crypto_key,
            crypto_algorithm: o.crypto_algorithm,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record progress unless the job already ended.
    fn advance(&self, state: JobState) {
        let mut f = self.lock();
        if !f.finished {
            f.state = state;
        }
    }

    fn stopped(&self) -> bool {
        let f = self.lock();
        f.cancelled || f.finished
    }

    fn fail(&self, err: InsertError, ctx: &ClientContext) {
        {
            let mut f = self.lock();
            if f.finished {
                return;
            }
            f.finished = true;
            f.state = JobState::Failed;
        }
        warn!(job = %self.id, kind = %err.kind(), error = ?err, "container insert failed");
        self.cb.on_failure(err, self, ctx);
    }
}

impl PutState for ContainerInserter {
    fn job_id(&self) -> JobId {
        self.id
    }

    fn parent(&self) -> &Arc<ClientPutter> {
        &self.parent
    }

    fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    #[instrument(skip_all, fields(job = %self.id, format = %self.archive_type))]
    fn schedule(&self, ctx: &ClientContext) -> Result<(), InsertError> {
        if self.stopped() {
            debug!("already finished, nothing to do");
            return Ok(());
        }
        let buckets = ctx.bucket_factory(self.options.persistent);

        let entries = match build_entries(&self.manifest, self.limits, buckets) {
            Ok((entries, _)) => entries,
            Err(e) => {
                self.fail(InsertError::internal(e), ctx);
                return Ok(());
            }
        };
        self.advance(JobState::MetadataBuilt);

        if self.stopped() {
            return Ok(());
        }
        let (packed, content_type) = match pack_to_bucket(&entries, self.archive_type, buckets) {
            Ok(v) => v,
            Err(e) => {
                self.fail(InsertError::storage(e), ctx);
                return Ok(());
            }
        };
        drop(entries);
        self.advance(JobState::ArchiveBuilt);
        debug!(size = packed.size(), content_type, "container packed");

        let block = InsertBlock { data: packed, content_type: content_type.to_string(), target_uri: self.target_uri.clone() };
        let delegate = match self.engine.make_inserter(
            self.parent.clone(),
            self.cb.clone(),
            block,
            self.block_options(),
            self.token.clone(),
        ) {
            Ok(d) => d,
            Err(e) => {
                self.fail(InsertError::storage(e), ctx);
                return Ok(());
            }
        };

        {
            let mut f = self.lock();
            if f.cancelled || f.finished {
                debug!("cancelled before hand-off");
                return Ok(());
            }
            f.finished = true;
            f.state = JobState::Delegated;
        }
        debug!(delegate = %delegate.job_id(), "handing off container block");
        self.cb.on_transition(self, delegate.clone(), ctx);

        match delegate.schedule(ctx) {
            Ok(()) => {
                self.lock().state = JobState::Completed;
                Ok(())
            }
            Err(e) => {
                warn!(delegate = %delegate.job_id(), kind = %e.kind(), "delegate failed to start");
                self.lock().state = JobState::Failed;
                Err(e.into_storage())
            }
        }
    }

    fn cancel(&self, ctx: &ClientContext) {
        {
            let mut f = self.lock();
            if f.cancelled || f.finished {
                return;
            }
            f.cancelled = true;
            f.finished = true;
            f.state = JobState::Cancelled;
        }
        debug!(job = %self.id, "container insert cancelled");
        self.cb.on_failure(InsertError::cancelled(), self, ctx);
    }
}
