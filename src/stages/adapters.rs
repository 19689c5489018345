//! Lambda-as-stage adapters: lift a plain function into a pipeline stage.

use crate::stage::{Flow, Sink, Stage};

/// Emit `f(x)` for every input element.
pub fn chan_iter<I, O, F>(f: F) -> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    Stage::new("chan_iter", move |flow| {
        while let Some(value) = flow.read() {
            flow.put(f(value));
        }
    })
}

/// Call `f(flow, x)` for every input element; `f` may emit zero or more
/// outputs through the flow.
pub fn chan_readwrite<I, O, F>(f: F) -> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(&mut Flow<I, O>, I) + Send + Sync + 'static,
{
    Stage::new("chan_readwrite", move |flow| {
        while let Some(value) = flow.read() {
            f(flow, value);
        }
    })
}

/// Call `f(x)` for every input element, emitting nothing.
pub fn chan_read<I, F>(f: F) -> Sink<I>
where
    I: Send + 'static,
    F: Fn(I) + Send + Sync + 'static,
{
    Sink::new("chan_read", move |flow| {
        while let Some(value) = flow.read() {
            f(value);
        }
    })
}

/// Pass through the elements for which `f` returns true.
pub fn chan_select<I, F>(f: F) -> Stage<I, I>
where
    I: Send + 'static,
    F: Fn(&I) -> bool + Send + Sync + 'static,
{
    Stage::new("chan_select", move |flow| {
        while let Some(value) = flow.read() {
            if f(&value) {
                flow.put(value);
            }
        }
    })
}
