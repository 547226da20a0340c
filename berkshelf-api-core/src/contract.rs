//! # contract: the capability interface every source connector implements
//!
//! A [`Worker`] is bound to exactly one remote source. It enumerates the cookbook
//! versions visible there, resolves per-version metadata on request, and can
//! download a version's files for repackaging by the gateway.
//!
//! ## Failure contract
//! - [`Worker::list_cookbooks`] reports source-level failure as an error; callers that
//!   only want "whatever is visible" use [`Worker::cookbooks`], which logs and returns
//!   an empty list instead. Invalid individual candidates are skipped inside the worker.
//! - [`Worker::metadata`] returns `None` when metadata cannot be found or parsed.
//! - [`Worker::shutdown`] is idempotent.
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall` so the cache builder can be driven by
//!   deterministic `MockWorker`s.

use std::path::Path;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{ArchiveError, SourceUnavailableError};
use crate::model::{Metadata, RemoteCookbook};

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable, source-specific identifier for logs and diagnostics.
    fn describe(&self) -> String;

    /// Priority this worker stamps on its reports. Lower wins.
    fn priority(&self) -> i64;

    /// Everything currently visible at the source.
    async fn list_cookbooks(&self) -> Result<Vec<RemoteCookbook>, SourceUnavailableError>;

    /// Like [`Worker::list_cookbooks`], but never fails: a transient remote failure is
    /// logged as a warning and yields an empty list.
    async fn cookbooks(&self) -> Vec<RemoteCookbook> {
        match self.list_cookbooks().await {
            Ok(cookbooks) => cookbooks,
            Err(e) => {
                tracing::warn!(worker = %self.describe(), error = %e, "Source unavailable");
                Vec::new()
            }
        }
    }

    /// Metadata for one discovered version, or `None` if the source has none usable.
    async fn metadata(&self, remote: &RemoteCookbook) -> Option<Metadata>;

    /// Write the files of `remote` into `destination` (an existing, empty directory).
    async fn download(
        &self,
        remote: &RemoteCookbook,
        destination: &Path,
    ) -> Result<(), ArchiveError>;

    /// Release any held session. Safe to call more than once.
    async fn shutdown(&self);
}
