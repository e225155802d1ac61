//! Handles given to callers holding a throttled connection

use std::sync::Arc;
use std::time::Duration;

use super::group::{BinSet, ThrottlingGroup};
use super::throttle_bin::ThrottleBin;
use crate::cancel::CancelToken;
use crate::error::CoordinationResult;

/// Permission to use one connection against a set of bins
///
/// Returned by [`Throttler::obtain_connection_permission`](super::Throttler::obtain_connection_permission),
/// which already waited for the first fetch. Every later fetch on the same
/// connection asks [`obtain_fetch_document_permission`](Self::obtain_fetch_document_permission)
/// first. Dropping the handle releases the connection.
#[derive(Debug)]
pub struct FetchThrottler {
    group: Arc<ThrottlingGroup>,
    bins: Vec<BinSet>,
    cancel: CancelToken,
    first_fetch_granted: bool,
    released: bool,
}

impl FetchThrottler {
    pub(crate) fn new(group: Arc<ThrottlingGroup>, bins: Vec<BinSet>, cancel: CancelToken) -> Self {
        Self {
            group,
            bins,
            cancel,
            first_fetch_granted: true,
            released: false,
        }
    }

    /// Names of the bins this connection counts against, sorted
    #[must_use]
    pub fn bin_names(&self) -> Vec<&str> {
        self.bins.iter().map(|set| set.connection.bin_name()).collect()
    }

    /// Block until every bin allows another fetch
    ///
    /// The first call after obtaining the connection returns at once.
    ///
    /// # Errors
    ///
    /// `Interrupted` on cancellation; `Setup` if the group was removed.
    pub fn obtain_fetch_document_permission(&mut self) -> CoordinationResult<()> {
        if std::mem::take(&mut self.first_fetch_granted) {
            return Ok(());
        }
        self.group.obtain_fetch(&self.bins, &self.cancel)
    }

    /// Start a fetch whose reads are paced by the bins' byte rates
    #[must_use]
    pub fn create_fetch_stream(&self) -> StreamThrottler {
        let bins: Vec<_> = self.bins.iter().map(|set| Arc::clone(&set.throttle)).collect();
        for bin in &bins {
            bin.begin_fetch();
        }
        StreamThrottler {
            bins,
            cancel: self.cancel.clone(),
            check_interval: self.group.check_interval(),
            closed: false,
        }
    }

    /// Give the connection back
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.group.release_connection(&self.bins);
        }
    }
}

impl Drop for FetchThrottler {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Paces the reads of one fetch
///
/// Call [`begin_read`](Self::begin_read) before each read and
/// [`end_read`](Self::end_read) or [`abort_read`](Self::abort_read) after it.
/// Dropping the stream closes it.
#[derive(Debug)]
pub struct StreamThrottler {
    bins: Vec<Arc<ThrottleBin>>,
    cancel: CancelToken,
    check_interval: Duration,
    closed: bool,
}

impl StreamThrottler {
    /// Wait until reading `count` bytes keeps every bin within its rate
    ///
    /// # Errors
    ///
    /// `Interrupted` on cancellation; `Setup` if the group was removed.
    pub fn begin_read(&mut self, count: usize) -> CoordinationResult<()> {
        for (index, bin) in self.bins.iter().enumerate() {
            if let Err(e) = bin.begin_read(count, &self.cancel, self.check_interval) {
                for begun in &self.bins[..index] {
                    begun.abort_read();
                    begun.end_read(count, 0);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// A read of `original` bytes returned `actual` bytes
    pub fn end_read(&mut self, original: usize, actual: usize) {
        for bin in &self.bins {
            bin.end_read(original, actual);
        }
    }

    /// The read begun last failed
    pub fn abort_read(&mut self) {
        for bin in &self.bins {
            bin.abort_read();
        }
    }

    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        for bin in &self.bins {
            bin.end_fetch();
        }
    }
}

impl Drop for StreamThrottler {
    fn drop(&mut self) {
        self.close_inner();
    }
}
