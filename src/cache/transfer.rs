// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfers, progress values and waiter handles.
//!
//! A [`Transfer`] is one in-progress download for one [`CacheKey`]. Every
//! caller interested in it holds a [`TransferHandle`] with its own event
//! channel. Progress is fanned out to all attached waiters in the same
//! order, and the terminal outcome is the last event each of them sees.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::key::CacheKey;
use crate::error::{CacheError, CacheResult};
use crate::sync::{resilient_read, resilient_write};

/// Bytes received so far for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub bytes_written: u64,
    /// `None` when the transport did not report a size.
    pub bytes_expected: Option<u64>,
}

impl Progress {
    pub fn new(bytes_written: u64, bytes_expected: Option<u64>) -> Self {
        Self {
            bytes_written,
            bytes_expected,
        }
    }

    /// A finished transfer of `bytes` bytes.
    pub fn complete(bytes: u64) -> Self {
        Self::new(bytes, Some(bytes))
    }

    /// Fraction in `[0, 1]`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_written as f64 / total as f64).clamp(0.0, 1.0)),
            None => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.fraction() == Some(1.0)
    }

    /// The value to publish after `self` given a raw report, or `None` if the
    /// report would move progress backwards or repeats the current value.
    fn advance(&self, report: Progress) -> Option<Progress> {
        if report.bytes_written < self.bytes_written {
            return None;
        }
        let next = Progress::new(report.bytes_written, report.bytes_expected.or(self.bytes_expected));
        if next == *self {
            return None;
        }
        match (self.fraction(), next.fraction()) {
            (Some(prev), Some(now)) if now < prev => None,
            (Some(_), None) => None,
            _ => Some(next),
        }
    }
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Created; storage is being re-probed.
    Pending,
    /// The downloader is receiving bytes.
    InFlight,
    /// The file is at its final path.
    Completed(PathBuf),
    /// Network, write or cancellation failure.
    Failed(CacheError),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed(_) | TransferState::Failed(_))
    }

    fn outcome(&self) -> Option<CacheResult<PathBuf>> {
        match self {
            TransferState::Completed(path) => Some(Ok(path.clone())),
            TransferState::Failed(err) => Some(Err(err.clone())),
            _ => None,
        }
    }
}

/// What a waiter observes.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(Progress),
    /// Always the last event on a waiter's channel.
    Finished(CacheResult<PathBuf>),
}

struct Waiter {
    id: u64,
    tx: mpsc::UnboundedSender<TransferEvent>,
}

struct TransferInner {
    state: TransferState,
    last_progress: Option<Progress>,
    waiters: Vec<Waiter>,
}

/// One download bound to one key.
pub struct Transfer {
    key: CacheKey,
    inner: RwLock<TransferInner>,
    cancel: CancellationToken,
    next_waiter_id: AtomicU64,
}

impl Transfer {
    pub(crate) fn new(key: CacheKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: RwLock::new(TransferInner {
                state: TransferState::Pending,
                last_progress: None,
                waiters: Vec::new(),
            }),
            cancel: CancellationToken::new(),
            next_waiter_id: AtomicU64::new(1),
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> TransferState {
        resilient_read(&self.inner).state.clone()
    }

    pub fn last_progress(&self) -> Option<Progress> {
        resilient_read(&self.inner).last_progress
    }

    pub fn waiter_count(&self) -> usize {
        resilient_read(&self.inner).waiters.len()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A new `Pending` transfer together with its first waiter.
    pub(crate) fn start(key: CacheKey, cancel_orphaned: bool) -> (Arc<Self>, TransferHandle) {
        let transfer = Self::new(key);
        let handle = {
            let mut inner = resilient_write(&transfer.inner);
            transfer.register(&mut inner, cancel_orphaned)
        };
        (transfer, handle)
    }

    /// Attach a new waiter.
    ///
    /// Returns `None` once the transfer has been cancelled, so the caller can
    /// start a fresh one instead of inheriting the cancellation. A waiter
    /// attaching late gets the last progress value, or the outcome if the
    /// transfer already finished.
    pub(crate) fn attach(self: &Arc<Self>, cancel_orphaned: bool) -> Option<TransferHandle> {
        let mut inner = resilient_write(&self.inner);
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(self.register(&mut inner, cancel_orphaned))
    }

    fn register(self: &Arc<Self>, inner: &mut TransferInner, cancel_orphaned: bool) -> TransferHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);

        if let Some(outcome) = inner.state.outcome() {
            let _ = tx.send(TransferEvent::Finished(outcome));
        } else {
            if let Some(progress) = inner.last_progress {
                let _ = tx.send(TransferEvent::Progress(progress));
            }
            inner.waiters.push(Waiter { id, tx });
        }

        TransferHandle {
            key: self.key.clone(),
            events: rx,
            attachment: Attachment {
                transfer: Arc::clone(self),
                id,
                cancel_orphaned,
            },
        }
    }

    fn detach(&self, id: u64, cancel_orphaned: bool) {
        let mut inner = resilient_write(&self.inner);
        let before = inner.waiters.len();
        inner.waiters.retain(|w| w.id != id);
        if before == inner.waiters.len() {
            return;
        }
        if inner.waiters.is_empty() && !inner.state.is_terminal() && cancel_orphaned {
            tracing::debug!(key = %self.key, "last waiter detached, cancelling transfer");
            self.cancel.cancel();
        }
    }

    pub(crate) fn set_in_flight(&self) {
        let mut inner = resilient_write(&self.inner);
        if inner.state == TransferState::Pending {
            inner.state = TransferState::InFlight;
        }
    }

    /// Publish a raw progress report from the downloader.
    pub(crate) fn report(&self, report: Progress) {
        let mut inner = resilient_write(&self.inner);
        if inner.state.is_terminal() {
            return;
        }
        let next = match inner.last_progress {
            Some(last) => match last.advance(report) {
                Some(next) => next,
                None => return,
            },
            None => report,
        };
        inner.last_progress = Some(next);
        for waiter in &inner.waiters {
            let _ = waiter.tx.send(TransferEvent::Progress(next));
        }
    }

    /// Move to a terminal state and notify every waiter. Idempotent.
    pub(crate) fn finish(&self, outcome: CacheResult<PathBuf>) {
        let mut inner = resilient_write(&self.inner);
        if inner.state.is_terminal() {
            return;
        }

        if outcome.is_ok() {
            let bytes = inner
                .last_progress
                .map(|p| p.bytes_expected.unwrap_or(0).max(p.bytes_written))
                .unwrap_or(0);
            let done = inner.last_progress.map(|p| p.is_complete()).unwrap_or(false);
            if !done {
                let last = Progress::complete(bytes);
                inner.last_progress = Some(last);
                for waiter in &inner.waiters {
                    let _ = waiter.tx.send(TransferEvent::Progress(last));
                }
            }
        }

        inner.state = match &outcome {
            Ok(path) => TransferState::Completed(path.clone()),
            Err(err) => TransferState::Failed(err.clone()),
        };
        // Dropping the senders closes each channel after the final event.
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.tx.send(TransferEvent::Finished(outcome.clone()));
        }
    }
}

/// Detaches its waiter from the transfer when dropped.
struct Attachment {
    transfer: Arc<Transfer>,
    id: u64,
    cancel_orphaned: bool,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.transfer.detach(self.id, self.cancel_orphaned);
    }
}

/// A waiter's view of a transfer. Dropping it detaches the waiter.
pub struct TransferHandle {
    key: CacheKey,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    attachment: Attachment,
}

impl TransferHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the underlying transfer.
    pub fn state(&self) -> TransferState {
        self.attachment.transfer.state()
    }

    /// Next event, or `None` after the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Forward progress to `on_progress` until the transfer finishes.
    pub async fn wait<F>(mut self, mut on_progress: F) -> CacheResult<PathBuf>
    where
        F: FnMut(Progress),
    {
        while let Some(event) = self.events.recv().await {
            match event {
                TransferEvent::Progress(progress) => on_progress(progress),
                TransferEvent::Finished(outcome) => return outcome,
            }
        }
        // The driver went away without reporting; treat as aborted.
        Err(CacheError::Cancelled)
    }

    /// This waiter's events as a stream.
    pub fn into_events(self) -> TransferEvents {
        TransferEvents {
            inner: UnboundedReceiverStream::new(self.events),
            _attachment: self.attachment,
        }
    }
}

/// Stream of a waiter's events; ends after [`TransferEvent::Finished`].
pub struct TransferEvents {
    inner: UnboundedReceiverStream<TransferEvent>,
    _attachment: Attachment,
}

impl Stream for TransferEvents {
    type Item = TransferEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
