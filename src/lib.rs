//! Sluice: compose a computation as a shell-style pipeline of concurrent
//! stages connected by typed, buffered, one-way message streams.
//!
//! Each stage runs on its own thread and talks to its neighbours only
//! through its streams. The `|` operator wires stages together and starts
//! the upstream side in the background; a pipeline ending in a [`Sink`]
//! runs the sink on the caller and blocks until everything has drained,
//! while a pipeline that still produces output is consumed with
//! [`Stage::collect`] or [`Stage::collect_into`].
//!
//! ```
//! use sluice::{from_iter, sort, to_lower, uniq};
//!
//! let words = vec!["Baker".to_string(), "able".to_string(), "baker".to_string()];
//! let folded = (from_iter(words) | to_lower() | sort(false) | uniq()).collect();
//! assert_eq!(folded, ["able", "baker"]);
//! ```
//!
//! Streams never block their writer: they grow in fixed-size chunks, and
//! the chunk is also the unit of lock amortisation, so steady traffic costs
//! one lock acquisition per chunk on each side. Readers block until data or
//! end-of-stream arrives; the end-of-stream signal is issued by the stage
//! runner, never left to the body.
//!
//! Beyond linear composition there are two fan-out forms: [`parallel`]
//! runs a fixed pool of clones of one stage when output order does not
//! matter, and [`schedule`] starts one sub-pipeline per input element. A
//! finished pipeline can also be hidden behind an [`encap`] handle and fed
//! imperatively with `put`/`close_input`/`read`.
//!
//! Failures stay out of band: fallible stages record a code into a
//! caller-supplied [`Status`] and end their stream early, so downstream
//! stages drain naturally and the caller checks the status afterwards.

pub mod encap;
pub mod error;
pub mod parallel;
pub mod stage;
pub mod stages;
pub mod stream;

pub use encap::{Encap, encap};
pub use error::{StageFault, Status};
pub use parallel::{parallel, schedule};
pub use stage::{Flow, Nothing, Sink, Stage};
pub use stages::adapters::{chan_iter, chan_read, chan_readwrite, chan_select};
pub use stages::basic::{cat, from_iter, grab, print, print_log, sort, to_lower, uniq};
pub use stages::exec::{exec_r, exec_rw, exec_w};
pub use stream::{DEFAULT_CHUNK, MessageStream};
