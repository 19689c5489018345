//! Everyday stages: file and collection sources, line filters, the
//! streaming sorter, and the printing sinks.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{StageFault, Status};
use crate::stage::{Nothing, Sink, Stage};

/// Emit every element of a collection, in order.
pub fn from_iter<T, C>(items: C) -> Stage<Nothing, T>
where
    T: Send + 'static,
    C: IntoIterator<Item = T> + Send + 'static,
{
    let items = Mutex::new(Some(items));
    Stage::source("from_iter", move |flow| {
        let Some(items) = items.lock().expect("from_iter source poisoned").take() else {
            return;
        };
        for value in items {
            flow.put(value);
        }
    })
}

/// Read the file at `path` line by line. Open or read failure records into
/// `status` and ends the stream early.
pub fn cat(path: impl Into<PathBuf>, status: &Status) -> Stage<Nothing, String> {
    let path = path.into();
    let status = status.clone();
    Stage::source("cat", move |flow| {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(source) => {
                status.record(StageFault::Open {
                    path: path.clone(),
                    source,
                });
                return;
            }
        };
        for line in BufReader::new(file).lines() {
            match line {
                Ok(line) => flow.put(line),
                Err(source) => {
                    status.record(StageFault::Read {
                        path: path.clone(),
                        source,
                    });
                    return;
                }
            }
        }
    })
}

/// Pass through lines containing `needle`, or not containing it when
/// `invert` is set.
pub fn grab(needle: impl Into<String>, invert: bool) -> Stage<String, String> {
    let needle = needle.into();
    Stage::new("grab", move |flow: &mut crate::stage::Flow<String, String>| {
        while let Some(line) = flow.read() {
            if line.contains(needle.as_str()) != invert {
                flow.put(line);
            }
        }
    })
}

/// Fold every line to lower case.
pub fn to_lower() -> Stage<String, String> {
    Stage::new("to_lower", |flow: &mut crate::stage::Flow<String, String>| {
        while let Some(line) = flow.read() {
            flow.put(line.to_lowercase());
        }
    })
}

/// Order the input, ascending unless `reverse`.
///
/// The heap is kept in the order opposite to the requested one so its root
/// is always the next element out: ingest pushes element by element while
/// the upstream is still producing, and the drain pops and emits element by
/// element while the downstream is already consuming. Sorting overlaps the
/// work on both sides instead of serialising behind a full buffer.
pub fn sort<T>(reverse: bool) -> Stage<T, T>
where
    T: Ord + Send + 'static,
{
    Stage::new("sort", move |flow| {
        if reverse {
            let mut heap = BinaryHeap::new();
            while let Some(value) = flow.read() {
                heap.push(value);
            }
            while let Some(value) = heap.pop() {
                flow.put(value);
            }
        } else {
            let mut heap = BinaryHeap::new();
            while let Some(value) = flow.read() {
                heap.push(Reverse(value));
            }
            while let Some(Reverse(value)) = heap.pop() {
                flow.put(value);
            }
        }
    })
}

/// Suppress adjacent duplicates. Pairs well with [`sort`].
pub fn uniq<T>() -> Stage<T, T>
where
    T: PartialEq + Clone + Send + 'static,
{
    Stage::new("uniq", |flow: &mut crate::stage::Flow<T, T>| {
        let Some(mut last) = flow.read() else {
            return;
        };
        flow.put(last.clone());
        while let Some(current) = flow.read() {
            if current != last {
                flow.put(current.clone());
            }
            last = current;
        }
    })
}

/// Write each line to stdout.
pub fn print() -> Sink<String> {
    Sink::new("print", |flow| {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        while let Some(line) = flow.read() {
            if writeln!(out, "{line}").is_err() {
                return;
            }
        }
    })
}

/// Write each line to stderr.
pub fn print_log() -> Sink<String> {
    Sink::new("print_log", |flow| {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        while let Some(line) = flow.read() {
            if writeln!(out, "{line}").is_err() {
                return;
            }
        }
    })
}
