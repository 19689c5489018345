//! The message stream: a chunked, growable FIFO connecting one producer
//! context to one consumer context.
//!
//! Writes never block for capacity; the chunk list grows as needed. A reader
//! that finds no data parks on the stream's condition variable until a writer
//! or [`MessageStream::done`] wakes it. Locking is amortised over whole
//! chunks: producers can publish a full chunk with one lock acquisition
//! ([`MessageStream::write_chunk`]) and consumers can remove the head chunk
//! with one ([`MessageStream::take_chunk`]), so the per-element paths only
//! serialise when the stream is nearly empty or a hint forces it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::vec;

/// Default chunk capacity of a stream.
pub const DEFAULT_CHUNK: usize = 32;

/// Streams at or below this many chunks are in the tight band: producers
/// write through instead of staging, so single elements stay visible to a
/// waiting reader.
pub(crate) const TIGHT_BAND: usize = 2;

/// A one-way, growable, chunked FIFO with an end-of-stream terminator.
///
/// One producer context and one consumer context at a time, unless the
/// always-lock hint is set, in which case any number of producers may write
/// and each write is serialised under the stream lock.
pub struct MessageStream<T> {
    shared: Mutex<Shared<T>>,
    readable: Condvar,
    chunk: usize,
    /// Chunk count mirror, so producers can pick a write band without
    /// touching the lock.
    depth: AtomicUsize,
    always_lock: AtomicBool,
    unbuffered: AtomicBool,
}

struct Shared<T> {
    /// Head chunk in element-granular consumption.
    draining: vec::IntoIter<T>,
    chunks: VecDeque<Vec<T>>,
    finished: bool,
    /// Readers currently parked on the condition variable.
    waiting: usize,
}

impl<T> MessageStream<T> {
    pub fn new() -> Self {
        Self::with_chunk(DEFAULT_CHUNK)
    }

    /// A stream whose chunks hold `chunk` elements. Small chunks force the
    /// rollover paths early, which is what the tests use them for.
    pub fn with_chunk(chunk: usize) -> Self {
        assert!(chunk.is_power_of_two(), "chunk capacity must be a power of two");
        MessageStream {
            shared: Mutex::new(Shared {
                draining: Vec::new().into_iter(),
                chunks: VecDeque::new(),
                finished: false,
                waiting: 0,
            }),
            readable: Condvar::new(),
            chunk,
            depth: AtomicUsize::new(0),
            always_lock: AtomicBool::new(false),
            unbuffered: AtomicBool::new(false),
        }
    }

    /// Append one element. Never fails and never blocks for capacity.
    ///
    /// On a multi-producer stream a write may lose the race with `done`;
    /// the late element is discarded.
    pub fn write(&self, value: T) {
        let mut shared = self.shared.lock().expect("message stream lock poisoned");
        if shared.finished {
            // Legitimate only where several producers share the stream and
            // one of them closes it; a lone producer writing after done is
            // a bug.
            debug_assert!(self.always_lock(), "write on a finished stream");
            return;
        }
        let rolled_over = shared
            .chunks
            .back()
            .is_none_or(|tail| tail.len() >= self.chunk);
        if rolled_over {
            shared.chunks.push_back(Vec::with_capacity(self.chunk));
            self.depth.fetch_add(1, Ordering::Relaxed);
        }
        shared
            .chunks
            .back_mut()
            .expect("a tail chunk exists after rollover")
            .push(value);
        let wake = shared.waiting > 0;
        drop(shared);
        if wake {
            self.readable.notify_all();
        }
    }

    /// Publish a staged chunk wholesale. One lock acquisition per chunk is
    /// the fast-band write.
    pub fn write_chunk(&self, chunk: Vec<T>) {
        debug_assert!(!chunk.is_empty(), "cannot publish an empty chunk");
        let mut shared = self.shared.lock().expect("message stream lock poisoned");
        if shared.finished {
            debug_assert!(self.always_lock(), "write on a finished stream");
            return;
        }
        shared.chunks.push_back(chunk);
        self.depth.fetch_add(1, Ordering::Relaxed);
        let wake = shared.waiting > 0;
        drop(shared);
        if wake {
            self.readable.notify_all();
        }
    }

    /// Remove and return the next element, blocking while the stream is
    /// empty but not finished. `None` means finished and fully drained, and
    /// every later call returns `None` again.
    pub fn recv(&self) -> Option<T> {
        let mut shared = self.shared.lock().expect("message stream lock poisoned");
        loop {
            if let Some(value) = shared.draining.next() {
                return Some(value);
            }
            if let Some(chunk) = shared.chunks.pop_front() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                shared.draining = chunk.into_iter();
                continue;
            }
            if shared.finished {
                return None;
            }
            shared.waiting += 1;
            shared = self
                .readable
                .wait(shared)
                .expect("message stream lock poisoned");
            shared.waiting -= 1;
        }
    }

    /// Remove and return the whole head chunk, blocking like [`recv`].
    /// One lock acquisition per chunk is the fast-band read; the caller
    /// iterates the returned chunk without any further locking.
    ///
    /// [`recv`]: MessageStream::recv
    pub fn take_chunk(&self) -> Option<Vec<T>> {
        let mut shared = self.shared.lock().expect("message stream lock poisoned");
        loop {
            if !shared.draining.as_slice().is_empty() {
                let rest = std::mem::replace(&mut shared.draining, Vec::new().into_iter());
                return Some(rest.collect());
            }
            if let Some(chunk) = shared.chunks.pop_front() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                return Some(chunk);
            }
            if shared.finished {
                return None;
            }
            shared.waiting += 1;
            shared = self
                .readable
                .wait(shared)
                .expect("message stream lock poisoned");
            shared.waiting -= 1;
        }
    }

    /// Declare end-of-stream. Called exactly once by the producer side;
    /// buffered elements stay readable and readers observe end-of-stream
    /// once they are gone.
    pub fn done(&self) {
        let mut shared = self.shared.lock().expect("message stream lock poisoned");
        debug_assert!(!shared.finished, "done called twice on a stream");
        shared.finished = true;
        drop(shared);
        self.readable.notify_all();
        tracing::trace!("stream finished");
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .lock()
            .expect("message stream lock poisoned")
            .finished
    }

    /// Buffered elements not yet consumed.
    pub fn len(&self) -> usize {
        let shared = self.shared.lock().expect("message stream lock poisoned");
        shared.draining.as_slice().len() + shared.chunks.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Current chunk count. A hint: by the time the caller acts on it the
    /// count may have moved, which only shifts where lock amortisation
    /// kicks in.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Force every write through the lock so that several producer contexts
    /// can share the stream. Set by the fan-out combinators before any
    /// concurrent producer starts.
    pub fn set_always_lock(&self, on: bool) {
        self.always_lock.store(on, Ordering::Release);
    }

    pub fn always_lock(&self) -> bool {
        self.always_lock.load(Ordering::Acquire)
    }

    /// Make every completed write immediately visible to readers instead of
    /// only on chunk rollover.
    pub fn set_unbuffered(&self, on: bool) {
        self.unbuffered.store(on, Ordering::Release);
    }

    pub fn unbuffered(&self) -> bool {
        self.unbuffered.load(Ordering::Acquire)
    }
}

impl<T> Default for MessageStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_producer_order_across_rollover() {
        let stream = MessageStream::with_chunk(4);
        for i in 0..13 {
            stream.write(i);
        }
        stream.done();
        for i in 0..13 {
            assert_eq!(stream.recv(), Some(i));
        }
        assert_eq!(stream.recv(), None);
        assert_eq!(stream.recv(), None);
    }

    #[test]
    fn mixed_chunk_and_element_writes_preserve_order() {
        let stream = MessageStream::with_chunk(4);
        stream.write(1);
        stream.write(2);
        stream.write_chunk(vec![3, 4, 5, 6]);
        stream.write(7);
        stream.done();

        assert_eq!(stream.take_chunk(), Some(vec![1, 2]));
        assert_eq!(stream.recv(), Some(3));
        // The rest of the head chunk comes out as a short chunk.
        assert_eq!(stream.take_chunk(), Some(vec![4, 5, 6]));
        assert_eq!(stream.take_chunk(), Some(vec![7]));
        assert_eq!(stream.take_chunk(), None);
    }

    #[test]
    fn reader_blocks_until_write() {
        let stream = Arc::new(MessageStream::with_chunk(4));
        let reader = {
            let stream = stream.clone();
            thread::spawn(move || stream.recv())
        };
        thread::sleep(Duration::from_millis(50));
        stream.write(42);
        assert_eq!(reader.join().unwrap(), Some(42));
    }

    #[test]
    fn reader_blocks_until_done() {
        let stream: Arc<MessageStream<i32>> = Arc::new(MessageStream::new());
        let reader = {
            let stream = stream.clone();
            thread::spawn(move || stream.recv())
        };
        thread::sleep(Duration::from_millis(50));
        stream.done();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn done_races_with_parked_reader() {
        // A reader deciding to park must never miss the wakeup from a
        // write-then-done producer.
        for _ in 0..10_000 {
            let stream = Arc::new(MessageStream::with_chunk(4));
            let reader = {
                let stream = stream.clone();
                thread::spawn(move || {
                    let first = stream.recv();
                    let second = stream.recv();
                    (first, second)
                })
            };
            stream.write(7);
            stream.done();
            assert_eq!(reader.join().unwrap(), (Some(7), None));
        }
    }

    #[test]
    fn always_lock_serialises_many_producers() {
        let stream = Arc::new(MessageStream::with_chunk(4));
        stream.set_always_lock(true);
        let producers: Vec<_> = (0..4usize)
            .map(|id| {
                let stream = stream.clone();
                thread::spawn(move || {
                    for seq in 0..250 {
                        stream.write((id, seq));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        stream.done();

        let mut next_seq = [0; 4];
        let mut total = 0;
        while let Some((id, seq)) = stream.recv() {
            // Per-producer order holds even though interleaving does not.
            assert_eq!(seq, next_seq[id]);
            next_seq[id] += 1;
            total += 1;
        }
        assert_eq!(total, 1000);
    }

    #[test]
    fn late_write_on_a_shared_stream_is_discarded() {
        let stream = MessageStream::with_chunk(4);
        stream.set_always_lock(true);
        stream.write(1);
        stream.done();
        // A producer that lost the race with done: no panic, no delivery.
        stream.write(2);
        assert_eq!(stream.recv(), Some(1));
        assert_eq!(stream.recv(), None);
    }

    #[test]
    fn slow_consumer_loses_nothing() {
        let stream = Arc::new(MessageStream::with_chunk(4));
        let producer = {
            let stream = stream.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    stream.write(i);
                }
                stream.done();
            })
        };
        let mut seen = Vec::new();
        while let Some(chunk) = stream.take_chunk() {
            seen.extend(chunk);
            thread::sleep(Duration::from_micros(200));
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn len_tracks_buffered_elements() {
        let stream = MessageStream::with_chunk(4);
        assert!(stream.is_empty());
        for i in 0..6 {
            stream.write(i);
        }
        assert_eq!(stream.len(), 6);
        assert_eq!(stream.recv(), Some(0));
        assert_eq!(stream.len(), 5);
    }
}
