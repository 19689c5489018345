//! Fan-out composition: a fixed worker pool over one stage, and dynamic
//! per-element scheduling of whole sub-pipelines.
//!
//! Both forms funnel their workers into one shared output stream carrying
//! the always-lock hint, and both clear the workers' ownership of that
//! stream so only the wrapping stage closes it, after every worker has been
//! joined. Output order across workers is unspecified; each worker's own
//! output order is preserved.

use std::sync::Arc;
use std::thread;

use crate::stage::{Flow, InputSlot, Nothing, Stage, join_all, run_stage};
use crate::stream::MessageStream;

/// Process one stage's input on `workers` clones of it, at the cost of
/// output order.
///
/// Each clone runs the same body against a private input stream; the
/// wrapper reads its own input and deals the elements round-robin. When the
/// input drains it closes every private stream, joins the clones, and only
/// then is the shared output closed. The output is the same multiset the
/// inner stage would have produced serially.
///
/// Panics when `workers` is zero or when the stage has already been
/// composed into a pipeline (only an elementary stage can be cloned).
pub fn parallel<I, O>(workers: usize, inner: Stage<I, O>) -> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    assert!(workers > 0, "parallel requires at least one worker");
    let body = inner
        .body
        .clone()
        .expect("parallel requires an elementary stage, not a composed pipeline");
    let worker_name = inner.name.clone();
    let name = format!("parallel({worker_name})");

    Stage::new(name, move |flow: &mut Flow<I, O>| {
        let shared = flow.output_stream();
        shared.set_always_lock(true);

        let mut inputs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for k in 0..workers {
            let input = Arc::new(MessageStream::<I>::new());
            let slot = Arc::new(InputSlot::bound_to(input.clone()));
            let body = body.clone();
            let shared = shared.clone();
            let thread_name = format!("{worker_name}.{k}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_stage(&thread_name, body.as_ref(), slot, Some(shared), false))
                .expect("failed to spawn stage thread");
            inputs.push(input);
            handles.push(handle);
        }

        let mut k = 0;
        while let Some(value) = flow.read() {
            inputs[k].write(value);
            k = (k + 1) % workers;
        }
        for input in &inputs {
            input.done();
        }
        join_all(handles);
    })
}

/// Run one sub-pipeline per input element, all concurrently.
///
/// For every element read, `factory` builds a fresh source pipeline which
/// is started in the background against the shared output with its
/// ownership cleared. The handles are kept until the input drains, then
/// joined; only then does the wrapping stage close the shared output.
/// Concurrency is unbounded over the input.
pub fn schedule<I, O, F>(factory: F) -> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Stage<Nothing, O> + Send + Sync + 'static,
{
    Stage::new("schedule", move |flow: &mut Flow<I, O>| {
        let shared = flow.output_stream();
        shared.set_always_lock(true);

        let mut handles = Vec::new();
        while let Some(value) = flow.read() {
            let inner = factory(value);
            handles.extend(inner.kept);
            let run = (inner.launch)(shared.clone(), false);
            handles.push(
                thread::Builder::new()
                    .name(inner.name)
                    .spawn(run)
                    .expect("failed to spawn stage thread"),
            );
        }
        join_all(handles);
    })
}
