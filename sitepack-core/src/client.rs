//! The seam between insertion jobs and the job tree that drives them.
//!
//! A job is a [`PutState`]: it is scheduled once, may be cancelled from
//! another thread, and reports back through a [`PutCompletion`]. A job that
//! hands its work to another job reports a transition instead of a result;
//! the new job then owns the outcome. [`outcome_channel`] turns these
//! callbacks into a stream of [`PutOutcome`] values that the caller can
//! follow to the final result.

use anyhow::{bail, Result};
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bucket::{BucketFactory, BucketRef, MemoryBucketFactory, TempBucketFactory};
use crate::error::InsertError;

/// Process-wide job identity, stable for the job's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        JobId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque caller value, passed through untouched.
pub type Token = Arc<dyn Any + Send + Sync>;

/// The request at the root of a job tree.
#[derive(Clone, Debug)]
pub struct ClientPutter {
    name: String,
    persistent: bool,
}

impl ClientPutter {
    pub fn new(name: impl Into<String>, persistent: bool) -> Arc<Self> {
        Arc::new(Self { name: name.into(), persistent })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }
}

/// Environment shared by the jobs of one client.
#[derive(Clone)]
pub struct ClientContext {
    temp_buckets: Arc<dyn BucketFactory>,
    persistent_buckets: Arc<dyn BucketFactory>,
}

impl ClientContext {
    pub fn new(temp_buckets: Arc<dyn BucketFactory>, persistent_buckets: Arc<dyn BucketFactory>) -> Self {
        Self { temp_buckets, persistent_buckets }
    }

    /// Everything in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBucketFactory), Arc::new(MemoryBucketFactory))
    }

    /// File-backed buckets, optionally under `dir`.
    pub fn temp_files(dir: Option<PathBuf>) -> Self {
        let f = Arc::new(TempBucketFactory::new(dir));
        Self::new(f.clone(), f)
    }

    /// The allocator a job with the given persistence should use.
    pub fn bucket_factory(&self, persistent: bool) -> &dyn BucketFactory {
        if persistent {
            self.persistent_buckets.as_ref()
        } else {
            self.temp_buckets.as_ref()
        }
    }
}

/// A schedulable insertion job.
pub trait PutState: Send + Sync {
    fn job_id(&self) -> JobId;

    fn parent(&self) -> &Arc<ClientPutter>;

    fn token(&self) -> Option<&Token>;

    /// Run the job. Failures are normally reported through the completion
    /// callback; an `Err` here means the job could not even be started.
    fn schedule(&self, ctx: &ClientContext) -> Result<(), InsertError>;

    /// Request cancellation. Idempotent.
    fn cancel(&self, ctx: &ClientContext);
}

/// Receives the outcome of a job.
pub trait PutCompletion: Send + Sync {
    /// `old` is superseded by `new`, which now owns the outcome.
    fn on_transition(&self, old: &dyn PutState, new: Arc<dyn PutState>, ctx: &ClientContext);

    fn on_failure(&self, error: InsertError, state: &dyn PutState, ctx: &ClientContext);

    fn on_success(&self, _state: &dyn PutState, _ctx: &ClientContext) {}

    fn on_generated_key(&self, _state: &dyn PutState, _key: &str, _ctx: &ClientContext) {}
}

/// One block for the block-insertion engine.
#[derive(Clone, Debug)]
pub struct InsertBlock {
    pub data: BucketRef,
    pub content_type: String,
    pub target_uri: Option<String>,
}

/// Flags and crypto parameters passed to the block-insertion engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockInsertOptions {
    pub dont_compress: bool,
    pub get_chk_only: bool,
    pub report_metadata_only: bool,
    pub early_encode: bool,
    pub persistent: bool,
    pub realtime: bool,
    pub force_crypto_key: Option<[u8; 32]>,
    pub crypto_algorithm: u8,
}

/// Factory for block-insertion jobs.
pub trait BlockInserter: Send + Sync {
    fn make_inserter(
        &self,
        parent: Arc<ClientPutter>,
        cb: Arc<dyn PutCompletion>,
        block: InsertBlock,
        options: BlockInsertOptions,
        token: Option<Token>,
    ) -> Result<Arc<dyn PutState>>;
}

/// A completion event.
pub enum PutOutcome {
    Superseded { from: JobId, by: Arc<dyn PutState> },
    GeneratedKey { job: JobId, key: String },
    Succeeded { job: JobId },
    Failed { job: JobId, error: InsertError },
}

impl fmt::Debug for PutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutOutcome::Superseded { from, by } => {
                f.debug_struct("Superseded").field("from", from).field("by", &by.job_id()).finish()
            }
            PutOutcome::GeneratedKey { job, key } => {
                f.debug_struct("GeneratedKey").field("job", job).field("key", key).finish()
            }
            PutOutcome::Succeeded { job } => f.debug_struct("Succeeded").field("job", job).finish(),
            PutOutcome::Failed { job, error } => {
                f.debug_struct("Failed").field("job", job).field("error", &error.kind()).finish()
            }
        }
    }
}

/// Completion that forwards every callback into a channel.
#[derive(Clone)]
pub struct OutcomeSender {
    tx: mpsc::Sender<PutOutcome>,
}

impl OutcomeSender {
    fn send(&self, outcome: PutOutcome) {
        // A dropped receiver means nobody is waiting any more.
        let _ = self.tx.send(outcome);
    }
}

impl PutCompletion for OutcomeSender {
    fn on_transition(&self, old: &dyn PutState, new: Arc<dyn PutState>, _ctx: &ClientContext) {
        self.send(PutOutcome::Superseded { from: old.job_id(), by: new });
    }

    fn on_failure(&self, error: InsertError, state: &dyn PutState, _ctx: &ClientContext) {
        self.send(PutOutcome::Failed { job: state.job_id(), error });
    }

    fn on_success(&self, state: &dyn PutState, _ctx: &ClientContext) {
        self.send(PutOutcome::Succeeded { job: state.job_id() });
    }

    fn on_generated_key(&self, state: &dyn PutState, key: &str, _ctx: &ClientContext) {
        self.send(PutOutcome::GeneratedKey { job: state.job_id(), key: key.to_string() });
    }
}

pub struct OutcomeReceiver {
    rx: mpsc::Receiver<PutOutcome>,
}

pub fn outcome_channel() -> (OutcomeSender, OutcomeReceiver) {
    let (tx, rx) = mpsc::channel();
    (OutcomeSender { tx }, OutcomeReceiver { rx })
}

/// Where a chain of jobs ended up.
#[derive(Debug)]
pub struct FinalOutcome {
    /// The job that produced the result.
    pub job: JobId,
    /// Jobs superseded on the way, oldest first.
    pub superseded: Vec<JobId>,
    pub key: Option<String>,
    pub result: Result<(), InsertError>,
}

impl OutcomeReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PutOutcome> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Every event already delivered, without waiting.
    pub fn drain(&self) -> Vec<PutOutcome> {
        self.rx.try_iter().collect()
    }

    /// Follow `job` through its transitions until some job in the chain
    /// succeeds or fails. Events for unrelated jobs are discarded.
    pub fn wait_final(&self, job: JobId, timeout: Duration) -> Result<FinalOutcome> {
        let deadline = Instant::now() + timeout;
        let mut current = job;
        let mut superseded = Vec::new();
        let mut key = None;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let Ok(event) = self.rx.recv_timeout(left) else {
                bail!("no final outcome for job {} within {:?}", current, timeout);
            };
            match event {
                PutOutcome::Superseded { from, by } if from == current => {
                    superseded.push(current);
                    current = by.job_id();
                }
                PutOutcome::GeneratedKey { job, key: k } if job == current => key = Some(k),
                PutOutcome::Succeeded { job } if job == current => {
                    return Ok(FinalOutcome { job, superseded, key, result: Ok(()) });
                }
                PutOutcome::Failed { job, error } if job == current => {
                    return Ok(FinalOutcome { job, superseded, key, result: Err(error) });
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InsertErrorKind;

    struct Dummy {
        id: JobId,
        parent: Arc<ClientPutter>,
    }

    impl Dummy {
        fn new() -> Arc<Self> {
            Arc::new(Self { id: JobId::next(), parent: ClientPutter::new("t", false) })
        }
    }

    impl PutState for Dummy {
        fn job_id(&self) -> JobId {
            self.id
        }

        fn parent(&self) -> &Arc<ClientPutter> {
            &self.parent
        }

        fn token(&self) -> Option<&Token> {
            None
        }

        fn schedule(&self, _ctx: &ClientContext) -> Result<(), InsertError> {
            Ok(())
        }

        fn cancel(&self, _ctx: &ClientContext) {}
    }

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::next();
        let b = JobId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn wait_final_follows_transitions() {
        let ctx = ClientContext::in_memory();
        let (tx, rx) = outcome_channel();
        let first = Dummy::new();
        let second = Dummy::new();
        let stray = Dummy::new();
        tx.on_failure(InsertError::cancelled(), stray.as_ref(), &ctx);
        tx.on_transition(first.as_ref(), second.clone(), &ctx);
        tx.on_generated_key(second.as_ref(), "CHK@abc", &ctx);
        tx.on_success(second.as_ref(), &ctx);

        let fin = rx.wait_final(first.job_id(), Duration::from_secs(5)).unwrap();
        assert_eq!(fin.job, second.job_id());
        assert_eq!(fin.superseded, [first.job_id()]);
        assert_eq!(fin.key.as_deref(), Some("CHK@abc"));
        assert!(fin.result.is_ok());
    }

    #[test]
    fn wait_final_reports_failure_and_times_out() {
        let ctx = ClientContext::in_memory();
        let (tx, rx) = outcome_channel();
        let job = Dummy::new();
        tx.on_failure(InsertError::cancelled(), job.as_ref(), &ctx);
        let fin = rx.wait_final(job.job_id(), Duration::from_secs(5)).unwrap();
        assert_eq!(fin.result.unwrap_err().kind(), InsertErrorKind::Cancelled);

        assert!(rx.wait_final(job.job_id(), Duration::from_millis(20)).is_err());
    }
}
