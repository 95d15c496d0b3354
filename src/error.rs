use std::{
    alloc::Layout,
    time::Duration
};

pub type Result<T> = std::result::Result<T, Error>;

/// What an initializer hands back on failure. Anything `?` can convert works.
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The memory backend refused an allocation. Never retried internally.
    #[error("allocation of {size} bytes (align {align}) failed")]
    AllocationFailure { size: usize, align: usize },
    /// The key is absent, or its object lost a race with its final release.
    #[error("no live object registered under this key")]
    NotFound,
    /// A weak handle outlived every strong handle to its payload.
    #[error("object has already been destroyed")]
    ObjectDestroyed,
    /// Returned to the thread that ran the initializer.
    #[error("object initialization failed")]
    InitFailed(#[source] InitError),
    /// Returned to threads that were waiting on an initializer that failed.
    #[error("object initialization was aborted by another thread")]
    InitAborted,
    #[error("timed out after {0:?} waiting for object initialization")]
    InitTimeout(Duration),
}

impl Error {
    pub(crate) fn alloc_failure(layout: Layout) -> Self {
        Self::AllocationFailure { size: layout.size(), align: layout.align() }
    }

    /// `true` for the errors a caller may resolve by simply retrying the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound | Self::InitAborted | Self::InitTimeout(_))
    }
}

#[cfg(test)]
pub mod tests {
    use super::Error;
    use std::{
        alloc::Layout,
        error::Error as StdError,
        time::Duration
    };
    type TestReturn = Result<(), Box<dyn StdError>>;

    #[test]
    fn allocation_failure_reports_layout() -> TestReturn {
        let err = Error::alloc_failure(Layout::new::<u64>());
        assert!(matches!(err, Error::AllocationFailure { size: 8, align: 8 }), "Unexpected error {:?}", err);
        assert!(!err.is_retryable(), "Allocation failures must not be retryable");
        Ok(())
    }

    #[test]
    fn retryable_kinds() -> TestReturn {
        assert!(Error::NotFound.is_retryable(), "NotFound should be retryable");
        assert!(Error::InitAborted.is_retryable(), "InitAborted should be retryable");
        assert!(Error::InitTimeout(Duration::from_millis(1)).is_retryable(), "InitTimeout should be retryable");
        assert!(!Error::ObjectDestroyed.is_retryable(), "ObjectDestroyed should not be retryable");
        Ok(())
    }

    #[test]
    fn init_failed_keeps_source() -> TestReturn {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "connection refused");
        let err = Error::InitFailed(Box::new(inner));
        let source = err.source().map(|s| s.to_string());
        assert!(source.as_deref() == Some("connection refused"), "Source should be preserved, got {:?}", source);
        Ok(())
    }
}
