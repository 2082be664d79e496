use thiserror::Error;

/// Errors that can occur while operating a block pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The background idle-reclamation thread could not be started.
    ///
    /// The pool remains fully usable in this state, but pooled memory is only
    /// returned to the system when [`reclaim_idle()`](crate::BlockPool::reclaim_idle)
    /// is called explicitly. Observe the condition via
    /// [`reclamation_error()`](crate::BlockPool::reclamation_error).
    #[error("failed to start the idle reclamation thread: {source}")]
    ReclamationUnavailable {
        /// The spawn failure reported by the operating system.
        source: std::io::Error,
    },
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn reclamation_unavailable_mentions_cause() {
        let error = Error::ReclamationUnavailable {
            source: std::io::Error::other("thread limit reached"),
        };

        assert!(error.to_string().contains("thread limit reached"));
    }
}
