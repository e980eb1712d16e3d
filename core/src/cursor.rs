//! Lazy, forward-only row cursor.
//!
//! A [`RowCursor`] is what a read request yields. Rows are produced on
//! demand by the connection provider through a bounded channel, so a large
//! result set never has to be materialised. The cursor cannot be rewound.
//!
//! Closing the cursor (explicitly with [`RowCursor::close`] or by dropping
//! it) tells the producer to stop, which lets the provider release the
//! connection backing the result set.
//!
//! # Example
//!
//! ```
//! use querybus_core::cursor::RowCursor;
//!
//! # async fn example() -> Result<(), querybus_core::ExecutionError> {
//! let mut cursor = RowCursor::from_rows(vec!["a", "b"]);
//! while let Some(row) = cursor.next().await {
//!     let row = row?;
//!     println!("{row}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::ExecutionError;
use futures::Stream;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

type Item<R> = Result<R, ExecutionError>;

enum Source<R> {
    Channel(mpsc::Receiver<Item<R>>),
    Buffered(VecDeque<R>),
    Exhausted,
}

/// Lazy, forward-only, finite sequence of rows.
pub struct RowCursor<R> {
    peeked: Option<Item<R>>,
    source: Source<R>,
}

/// Producer half of a channel-backed [`RowCursor`].
///
/// Held by the connection provider while it streams a result set.
pub struct RowSink<R> {
    sender: mpsc::Sender<Item<R>>,
}

impl<R> RowCursor<R> {
    /// A cursor over zero rows.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            peeked: None,
            source: Source::Exhausted,
        }
    }

    /// A cursor over rows already in memory.
    #[must_use]
    pub fn from_rows(rows: Vec<R>) -> Self {
        Self {
            peeked: None,
            source: Source::Buffered(rows.into()),
        }
    }

    /// Create a channel-backed cursor and the sink that feeds it.
    ///
    /// `buffer` bounds how many rows the producer may run ahead of the
    /// consumer. A zero buffer is treated as one.
    #[must_use]
    pub fn channel(buffer: usize) -> (RowSink<R>, Self) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            RowSink { sender },
            Self {
                peeked: None,
                source: Source::Channel(receiver),
            },
        )
    }

    /// Pull the first item so that a failing statement surfaces as an error
    /// here instead of on the caller's first read.
    ///
    /// # Errors
    ///
    /// Returns the producer's error if the very first item is an error.
    pub async fn prefetch(mut self) -> Result<Self, ExecutionError> {
        if self.peeked.is_none() {
            match self.next().await {
                Some(Err(error)) => return Err(error),
                Some(Ok(row)) => self.peeked = Some(Ok(row)),
                None => {}
            }
        }
        Ok(self)
    }

    /// Advance the cursor.
    ///
    /// Returns `None` once the result set is exhausted. After an error the
    /// cursor is exhausted as well.
    pub async fn next(&mut self) -> Option<Item<R>> {
        std::future::poll_fn(|cx| self.poll_item(cx)).await
    }

    /// Take the first row, if any, and close the cursor.
    ///
    /// # Errors
    ///
    /// Returns the producer's error if reading the first row failed.
    pub async fn first(mut self) -> Result<Option<R>, ExecutionError> {
        let first = self.next().await.transpose();
        self.close();
        first
    }

    /// Drain the remaining rows into a vector.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the producer; rows read before
    /// it are discarded.
    pub async fn collect_rows(mut self) -> Result<Vec<R>, ExecutionError> {
        let mut rows = Vec::new();
        while let Some(item) = self.next().await {
            rows.push(item?);
        }
        Ok(rows)
    }

    /// Close the cursor and release whatever produces its rows.
    pub fn close(mut self) {
        if let Source::Channel(receiver) = &mut self.source {
            receiver.close();
        }
    }

    /// Whether the cursor is known to have no more rows.
    ///
    /// A channel-backed cursor only learns this when it is polled past its
    /// last row.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.peeked.is_none()
            && match &self.source {
                Source::Exhausted => true,
                Source::Buffered(rows) => rows.is_empty(),
                Source::Channel(_) => false,
            }
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<Item<R>>> {
        if let Some(item) = self.peeked.take() {
            return Poll::Ready(Some(item));
        }

        let polled = match &mut self.source {
            Source::Channel(receiver) => match receiver.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(item) => item,
            },
            Source::Buffered(rows) => rows.pop_front().map(Ok),
            Source::Exhausted => None,
        };

        if matches!(polled, None | Some(Err(_))) {
            self.source = Source::Exhausted;
        }
        Poll::Ready(polled)
    }
}

impl<R> Unpin for RowCursor<R> {}

impl<R> Stream for RowCursor<R> {
    type Item = Item<R>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_item(cx)
    }
}

impl<R> fmt::Debug for RowCursor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Channel(_) => "channel",
            Source::Buffered(_) => "buffered",
            Source::Exhausted => "exhausted",
        };
        f.debug_struct("RowCursor")
            .field("source", &source)
            .field("peeked", &self.peeked.is_some())
            .finish()
    }
}

impl<R> RowSink<R> {
    /// Push one row to the cursor, waiting for buffer space.
    ///
    /// Returns `false` once the consumer has closed the cursor; the
    /// producer should stop and release its resources.
    pub async fn push(&self, row: R) -> bool {
        self.sender.send(Ok(row)).await.is_ok()
    }

    /// Report a mid-stream failure. The cursor ends after the error.
    pub async fn fail(self, error: ExecutionError) {
        let _ = self.sender.send(Err(error)).await;
    }

    /// Whether the consumer has closed the cursor.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<R> fmt::Debug for RowSink<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSink")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
