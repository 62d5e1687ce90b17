use std::fmt;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What went wrong with an insertion job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InsertErrorKind {
    /// Bucket allocation, archive I/O, or delegate hand-off failed.
    Storage,
    /// Descriptor construction failed for a non-structural reason.
    Internal,
    /// The job was cancelled before it could hand off.
    Cancelled,
}

impl fmt::Display for InsertErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InsertErrorKind::Storage => "storage error",
            InsertErrorKind::Internal => "internal error",
            InsertErrorKind::Cancelled => "cancelled",
        })
    }
}

/// Terminal failure of an insertion job, delivered once through its
/// completion callback.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct InsertError {
    kind: InsertErrorKind,
    #[source]
    cause: Option<Cause>,
}

impl InsertError {
    pub fn new(kind: InsertErrorKind, cause: Option<Cause>) -> Self {
        Self { kind, cause }
    }

    pub fn storage(cause: impl Into<Cause>) -> Self {
        Self::new(InsertErrorKind::Storage, Some(cause.into()))
    }

    pub fn internal(cause: impl Into<Cause>) -> Self {
        Self::new(InsertErrorKind::Internal, Some(cause.into()))
    }

    pub fn cancelled() -> Self {
        Self::new(InsertErrorKind::Cancelled, None)
    }

    pub fn kind(&self) -> InsertErrorKind {
        self.kind
    }

    /// Re-label as a storage error, keeping the cause chain.
    pub fn into_storage(self) -> Self {
        Self { kind: InsertErrorKind::Storage, ..self }
    }
}
