//! aiOS filesystem activity observer
//!
//! Watches one or more roots through inotify and reports every open,
//! close-after-write and close-without-write under them.

pub mod config;
pub mod decoder;
pub mod error;
pub mod event_loop;
pub mod registry;
pub mod sink;
pub mod source;

pub use decoder::{decode_batch, Activity, DecodedEvent, RawRecordHeader, WatchId};
pub use error::{WatchError, WatchResult};
pub use event_loop::{EventLoop, LoopStats, UnknownWatchPolicy};
pub use registry::{WatchEntry, WatchRegistry};
pub use sink::{EmitSink, JsonSink, TextSink, VecSink};
pub use source::{InotifySession, NotificationSource, Readiness};
