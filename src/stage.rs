//! Stages and pipeline composition.
//!
//! A [`Stage`] is a unit of work with at most one input stream and at most
//! one output stream, run on its own thread when composed into a pipeline.
//! The `|` operator wires the left stage's output stream in as the right
//! stage's input stream and launches the left side in the background; a
//! [`Sink`] on the right side instead runs on the caller and blocks until
//! the whole pipeline has drained. A pipeline whose tail still produces
//! output is consumed with [`Stage::collect`] or [`Stage::collect_into`].
//!
//! Bodies are plain closures over a [`Flow`], which hands them blocking
//! `read` and non-blocking `put` against the stage's streams. The runner,
//! not the body, closes the output stream when the body returns, so a stage
//! that completes normally can never leave its downstream blocked.

use std::ops::BitOr;
use std::panic;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::vec;

use crate::stream::{MessageStream, TIGHT_BAND};

/// The input type of a source and the output type of a sink. Uninhabited,
/// so no value of it can ever be produced or consumed.
#[derive(Debug, Clone, Copy)]
pub enum Nothing {}

pub(crate) type Body<I, O> = Arc<dyn Fn(&mut Flow<I, O>) + Send + Sync>;

/// Launches the not-yet-started tail stage of a chain against a given
/// output stream. The ownership flag decides whether the runner closes that
/// stream afterwards; fan-out combinators clear it when several workers
/// share one output.
pub(crate) type Launch<O> =
    Box<dyn FnOnce(Arc<MessageStream<O>>, bool) -> Box<dyn FnOnce() + Send> + Send>;

enum SlotState<T> {
    /// No upstream bound yet.
    Pending,
    Bound(Arc<MessageStream<T>>),
    /// A source; nothing will ever be bound.
    Sealed,
}

/// The attachment point where a chain receives its input stream.
///
/// Composition and encapsulation bind the slot before the stage is
/// launched; the condition variable covers the remaining window where a
/// running body could look before the binding lands.
pub(crate) struct InputSlot<T> {
    state: Mutex<SlotState<T>>,
    bound: Condvar,
}

impl<T> InputSlot<T> {
    pub(crate) fn pending() -> Self {
        InputSlot {
            state: Mutex::new(SlotState::Pending),
            bound: Condvar::new(),
        }
    }

    pub(crate) fn sealed() -> Self {
        InputSlot {
            state: Mutex::new(SlotState::Sealed),
            bound: Condvar::new(),
        }
    }

    pub(crate) fn bound_to(stream: Arc<MessageStream<T>>) -> Self {
        InputSlot {
            state: Mutex::new(SlotState::Bound(stream)),
            bound: Condvar::new(),
        }
    }

    pub(crate) fn bind(&self, stream: Arc<MessageStream<T>>) {
        let mut state = self.state.lock().expect("input slot lock poisoned");
        match *state {
            SlotState::Pending => *state = SlotState::Bound(stream),
            SlotState::Bound(_) => panic!("stage input is already attached"),
            SlotState::Sealed => panic!("cannot attach an input to a source stage"),
        }
        drop(state);
        self.bound.notify_all();
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(
            *self.state.lock().expect("input slot lock poisoned"),
            SlotState::Pending
        )
    }

    fn wait(&self) -> Option<Arc<MessageStream<T>>> {
        let mut state = self.state.lock().expect("input slot lock poisoned");
        loop {
            match &*state {
                SlotState::Pending => {
                    state = self.bound.wait(state).expect("input slot lock poisoned");
                }
                SlotState::Bound(stream) => return Some(stream.clone()),
                SlotState::Sealed => return None,
            }
        }
    }
}

/// A running body's view of its stage: blocking reads from the input
/// stream, buffered writes to the output stream.
///
/// `Flow` carries the producer-side staging chunk and the consumer-side
/// chunk cache, so steady-state element traffic touches the stream lock
/// once per chunk on either side.
pub struct Flow<I, O> {
    slot: Arc<InputSlot<I>>,
    input: Option<Option<Arc<MessageStream<I>>>>,
    rbuf: vec::IntoIter<I>,
    output: Option<Arc<MessageStream<O>>>,
    wbuf: Vec<O>,
}

impl<I, O> Flow<I, O> {
    fn new(slot: Arc<InputSlot<I>>, output: Option<Arc<MessageStream<O>>>) -> Self {
        Flow {
            slot,
            input: None,
            rbuf: Vec::new().into_iter(),
            output,
            wbuf: Vec::new(),
        }
    }

    /// Read the next input element, blocking while the upstream is alive
    /// but has produced nothing. `None` means the upstream has finished and
    /// every element has been consumed. On a source this is always `None`.
    pub fn read(&mut self) -> Option<I> {
        if let Some(value) = self.rbuf.next() {
            return Some(value);
        }
        let stream = match self.input.get_or_insert_with(|| self.slot.wait()) {
            Some(stream) => stream,
            None => return None,
        };
        match stream.take_chunk() {
            Some(chunk) => {
                self.rbuf = chunk.into_iter();
                self.rbuf.next()
            }
            None => None,
        }
    }

    /// Emit one output element. Never blocks on a full buffer; the stream
    /// grows instead.
    ///
    /// When the output stream is backlogged the element is staged locally
    /// and published a whole chunk at a time; when the stream is close to
    /// empty, or carries the always-lock or unbuffered hint, the element is
    /// written through immediately so a waiting reader sees it. The same
    /// call is therefore safe from fan-out workers sharing one output.
    pub fn put(&mut self, value: O) {
        let out = self.output.as_ref().expect("stage has no output stream");
        if out.always_lock() || out.unbuffered() {
            out.write(value);
            return;
        }
        if self.wbuf.is_empty() && out.depth() <= TIGHT_BAND {
            out.write(value);
            return;
        }
        self.wbuf.push(value);
        if self.wbuf.len() >= out.chunk_size() || out.depth() <= TIGHT_BAND {
            out.write_chunk(std::mem::take(&mut self.wbuf));
        }
    }

    /// Publish any staged residue. The runner calls this when the body
    /// returns; bodies that hand their output stream to helper threads may
    /// call it themselves first.
    pub fn flush(&mut self) {
        if !self.wbuf.is_empty() {
            let out = self.output.as_ref().expect("stage has no output stream");
            out.write_chunk(std::mem::take(&mut self.wbuf));
        }
    }

    pub(crate) fn output_stream(&self) -> Arc<MessageStream<O>> {
        self.output
            .as_ref()
            .expect("stage has no output stream")
            .clone()
    }
}

/// Run one stage to completion on the current thread: resolve the input,
/// run the body, flush, and close the output if this stage owns it.
///
/// The output closes even when the body panics, so a crashing stage cannot
/// strand its downstream mid-read; the panic itself resurfaces when the
/// pipeline is joined.
pub(crate) fn run_stage<I, O>(
    name: &str,
    body: &dyn Fn(&mut Flow<I, O>),
    slot: Arc<InputSlot<I>>,
    output: Option<Arc<MessageStream<O>>>,
    owns_output: bool,
) {
    let _span = tracing::debug_span!("stage", name).entered();
    tracing::debug!("Stage [{name}] running");
    let mut flow = Flow::new(slot, output.clone());
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| body(&mut flow)));
    if outcome.is_ok() {
        flow.flush();
    }
    if owns_output {
        if let Some(out) = output {
            out.done();
            tracing::debug!("Stage [{name}] closed its output");
        }
    }
    match outcome {
        Ok(()) => tracing::debug!("Stage [{name}] finished"),
        Err(payload) => panic::resume_unwind(payload),
    }
}

pub(crate) fn spawn_stage<O: Send + 'static>(
    launch: Launch<O>,
    thread_name: &str,
    output: Arc<MessageStream<O>>,
    owns_output: bool,
) -> JoinHandle<()> {
    let run = launch(output, owns_output);
    thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(run)
        .expect("failed to spawn stage thread")
}

/// Join every background stage of a consumed pipeline. A panic that
/// escaped a body is resumed here on the joining thread.
pub(crate) fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(payload) = handle.join() {
            panic::resume_unwind(payload);
        }
    }
}

/// A stage, or after composition the whole chain up to and including its
/// rightmost stage. `I` is the input type of the chain's head, `O` the
/// output type of its tail.
pub struct Stage<I, O> {
    pub(crate) name: String,
    pub(crate) head: Arc<InputSlot<I>>,
    pub(crate) output: Arc<MessageStream<O>>,
    pub(crate) launch: Launch<O>,
    /// Join handles of every predecessor already running in the
    /// background. Composition moves the left chain's handles in here, so
    /// holding the rightmost stage keeps the whole chain alive.
    pub(crate) kept: Vec<JoinHandle<()>>,
    /// The body, kept shareable while the stage is still elementary so
    /// fan-out can clone it. Composition erases it.
    pub(crate) body: Option<Body<I, O>>,
}

impl<I, O> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// A transforming stage. The body reads its input through the flow and
    /// emits through it; it runs once the stage is composed into a
    /// pipeline.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Flow<I, O>) + Send + Sync + 'static,
    {
        Self::build(name.into(), Arc::new(body), InputSlot::pending())
    }

    fn build(name: String, body: Body<I, O>, slot: InputSlot<I>) -> Self {
        let head = Arc::new(slot);
        let launch_name = name.clone();
        let launch_body = body.clone();
        let launch_slot = head.clone();
        let launch: Launch<O> = Box::new(move |output, owns_output| {
            Box::new(move || {
                run_stage(
                    &launch_name,
                    launch_body.as_ref(),
                    launch_slot,
                    Some(output),
                    owns_output,
                )
            })
        });
        Stage {
            name,
            head,
            output: Arc::new(MessageStream::new()),
            launch,
            kept: Vec::new(),
            body: Some(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the output stream with one of the given chunk capacity.
    /// Call before composing anything downstream of this stage.
    pub fn chunk(mut self, chunk: usize) -> Self {
        self.output = Arc::new(MessageStream::with_chunk(chunk));
        self
    }

    /// Run the tail stage on the caller, then drain its output into `out`.
    /// Returns once every stage of the pipeline has finished and been
    /// joined.
    pub fn collect_into(self, out: &mut Vec<O>) {
        let Stage {
            head,
            output,
            launch,
            kept,
            ..
        } = self;
        assert!(
            !head.is_pending(),
            "cannot consume a pipeline whose input was never attached"
        );
        let run = launch(output.clone(), true);
        run();
        while let Some(chunk) = output.take_chunk() {
            out.extend(chunk);
        }
        join_all(kept);
    }

    /// [`collect_into`] into a fresh vector.
    ///
    /// [`collect_into`]: Stage::collect_into
    pub fn collect(self) -> Vec<O> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }
}

impl<O> Stage<Nothing, O>
where
    O: Send + 'static,
{
    /// A producing stage with no input. The body can only emit.
    pub fn source<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Flow<Nothing, O>) + Send + Sync + 'static,
    {
        Self::build(name.into(), Arc::new(body), InputSlot::sealed())
    }
}

/// A stage whose output type is the unit type; it terminates a pipeline
/// and runs on the caller when composed.
pub struct Sink<I> {
    pub(crate) name: String,
    pub(crate) head: Arc<InputSlot<I>>,
    pub(crate) launch: Box<dyn FnOnce() -> Box<dyn FnOnce() + Send> + Send>,
}

impl<I> Sink<I>
where
    I: Send + 'static,
{
    /// A consuming stage. The body reads until end-of-stream; it cannot
    /// emit because no [`Nothing`] value exists to emit.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Flow<I, Nothing>) + Send + Sync + 'static,
    {
        let name = name.into();
        let head = Arc::new(InputSlot::pending());
        let launch_name = name.clone();
        let launch_body: Body<I, Nothing> = Arc::new(body);
        let launch_slot = head.clone();
        let launch = Box::new(move || {
            let run: Box<dyn FnOnce() + Send> = Box::new(move || {
                run_stage(&launch_name, launch_body.as_ref(), launch_slot, None, false)
            });
            run
        });
        Sink { name, head, launch }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Pipe composition. Binds the right side's input to the left side's
/// output, launches the left tail in the background, and yields the
/// extended chain with the left side's handles kept alive.
impl<A, B, C> BitOr<Stage<B, C>> for Stage<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    type Output = Stage<A, C>;

    fn bitor(self, rhs: Stage<B, C>) -> Stage<A, C> {
        let Stage {
            name: left_name,
            head,
            output,
            launch,
            mut kept,
            ..
        } = self;
        rhs.head.bind(output.clone());
        kept.push(spawn_stage(launch, &left_name, output, true));
        kept.extend(rhs.kept);
        Stage {
            name: rhs.name,
            head,
            output: rhs.output,
            launch: rhs.launch,
            kept,
            body: None,
        }
    }
}

/// Pipe composition into a sink. The left side goes to the background, the
/// sink runs on the caller, and the call returns only when the whole
/// pipeline has drained and every stage has been joined.
impl<A, B> BitOr<Sink<B>> for Stage<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    type Output = ();

    fn bitor(self, rhs: Sink<B>) {
        let Stage {
            name: left_name,
            head,
            output,
            launch,
            mut kept,
            ..
        } = self;
        assert!(
            !head.is_pending(),
            "cannot consume a pipeline whose input was never attached"
        );
        rhs.head.bind(output.clone());
        kept.push(spawn_stage(launch, &left_name, output, true));
        let run = (rhs.launch)();
        run();
        join_all(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn numbers(upto: i64) -> Stage<Nothing, i64> {
        Stage::source("numbers", move |flow| {
            for i in 0..upto {
                flow.put(i);
            }
        })
    }

    fn double() -> Stage<i64, i64> {
        Stage::new("double", |flow| {
            while let Some(v) = flow.read() {
                flow.put(v * 2);
            }
        })
    }

    #[test]
    fn identity_pipeline_round_trips() {
        let out = (numbers(10) | Stage::new("id", |flow: &mut Flow<i64, i64>| {
            while let Some(v) = flow.read() {
                flow.put(v);
            }
        }))
        .collect();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn empty_input_terminates_every_stage() {
        let out = (numbers(0) | double() | double()).collect();
        assert!(out.is_empty());
    }

    #[test]
    fn single_element_stays_in_the_tight_band() {
        let out = (numbers(1) | double()).collect();
        assert_eq!(out, [0]);
    }

    #[test]
    fn small_chunks_force_rollover() {
        // Three chunks and change, so the fast band engages.
        let out = (numbers(14).chunk(4) | double().chunk(4)).collect();
        assert_eq!(out, (0..14).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn source_alone_collects() {
        let mut out = Vec::new();
        numbers(5).collect_into(&mut out);
        assert_eq!(out, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn sink_runs_on_the_caller_and_blocks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink = Sink::new("count", move |flow: &mut Flow<i64, Nothing>| {
            while flow.read().is_some() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        numbers(100) | double() | sink;
        // The composition blocked until the sink drained everything.
        assert_eq!(seen.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn slow_producer_still_delivers_in_order() {
        let dripping = Stage::source("drip", |flow| {
            for i in 0..10 {
                thread::sleep(Duration::from_millis(2));
                flow.put(i);
            }
        });
        let out = (dripping | double()).collect();
        assert_eq!(out, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn slow_consumer_accumulates_chunks() {
        let out = (numbers(200).chunk(4)
            | Stage::new("dawdle", |flow: &mut Flow<i64, i64>| {
                while let Some(v) = flow.read() {
                    if v % 50 == 0 {
                        thread::sleep(Duration::from_millis(5));
                    }
                    flow.put(v);
                }
            })
            .chunk(4))
        .collect();
        assert_eq!(out, (0..200).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "never attached")]
    fn collecting_a_headless_pipeline_panics() {
        double().collect();
    }

    #[test]
    fn a_panicking_body_closes_its_output_and_resurfaces() {
        let boom = Stage::new("boom", |flow: &mut Flow<i64, i64>| {
            let _ = flow.read();
            panic!("stage blew up");
        });
        let pipeline = numbers(10) | boom | double();
        // The downstream drains instead of hanging; the panic comes back
        // when the pipeline is joined.
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| pipeline.collect()));
        assert!(result.is_err());
    }

    #[test]
    fn composed_pipelines_associate_either_way() {
        let left = (numbers(20) | double()) | double();
        assert_eq!(left.collect(), (0..20).map(|i| i * 4).collect::<Vec<_>>());

        let right = numbers(20) | (double() | double());
        assert_eq!(right.collect(), (0..20).map(|i| i * 4).collect::<Vec<_>>());
    }
}
