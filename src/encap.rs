//! Feeding a pipeline from ordinary code.
//!
//! [`encap`] hides a fully built pipeline behind a handle with `put`,
//! `close_input`, and `read`, so code that is not itself a stage can push
//! values in from one or more threads and pull results out of the far end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::stage::{Stage, spawn_stage};
use crate::stream::MessageStream;

/// A live pipeline exposed as a plain put/read object. Values go in with
/// [`put`], the input side is closed once with [`close_input`], and results
/// come out of [`read`] until it returns `None`.
///
/// The handle is `Sync`: several threads may `put` concurrently (the feed
/// stream carries the always-lock hint), and `close_input` may race with
/// them from another thread. Reading stays single-consumer.
///
/// [`put`]: Encap::put
/// [`close_input`]: Encap::close_input
/// [`read`]: Encap::read
pub struct Encap<I, O> {
    feed: Arc<MessageStream<I>>,
    out: Arc<MessageStream<O>>,
    closed: AtomicBool,
    workers: Vec<JoinHandle<()>>,
}

/// Wrap a pipeline behind an [`Encap`] handle and start it in the
/// background. The pipeline's head must still be unattached.
pub fn encap<I, O>(pipeline: Stage<I, O>) -> Encap<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let Stage {
        name,
        head,
        output,
        launch,
        kept: mut workers,
        ..
    } = pipeline;

    let feed = Arc::new(MessageStream::new());
    feed.set_always_lock(true);
    head.bind(feed.clone());

    let out = output.clone();
    workers.push(spawn_stage(launch, &name, output, true));
    tracing::debug!("Stage [{name}] encapsulated");

    Encap {
        feed,
        out,
        closed: AtomicBool::new(false),
        workers,
    }
}

impl<I, O> Encap<I, O> {
    /// Push one value into the pipeline.
    pub fn put(&self, value: I) {
        self.feed.write(value);
    }

    /// Declare the input finished. Idempotent; after the pipeline drains,
    /// [`read`](Encap::read) starts returning `None`.
    pub fn close_input(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.feed.done();
        }
    }

    /// Pull the next result, blocking while the pipeline is still working.
    /// `None` once the input is closed and everything has drained through.
    pub fn read(&self) -> Option<O> {
        self.out.recv()
    }
}

impl<I, O> Drop for Encap<I, O> {
    fn drop(&mut self) {
        self.close_input();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
