//! Emit sinks: where decoded, resolved events end up
//!
//! The loop calls `emit` once per event, in batch order. Sinks own their
//! failures: a broken stdout is logged here and never bubbles back into the
//! loop.

use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::warn;

use crate::decoder::DecodedEvent;

pub trait EmitSink {
    fn emit(&mut self, root: &Path, event: &DecodedEvent);
}

/// Render one event as a classic text line, without trailing newline:
/// `IN_OPEN: /tmp/name [file]`
pub fn render_line(root: &Path, event: &DecodedEvent) -> String {
    let mut line = String::new();
    for label in event.activity.labels() {
        line.push_str(label);
        line.push_str(": ");
    }
    if event.unmounted {
        line.push_str("IN_UNMOUNT: ");
    }
    if event.watch_removed {
        line.push_str("IN_IGNORED: ");
    }
    line.push_str(&root.to_string_lossy());
    line.push('/');
    if let Some(name) = &event.name {
        line.push_str(&name.to_string_lossy());
    }
    line.push_str(if event.is_directory {
        " [directory]"
    } else {
        " [file]"
    });
    line
}

/// Line-per-event text output
#[derive(Debug)]
pub struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EmitSink for TextSink<W> {
    fn emit(&mut self, root: &Path, event: &DecodedEvent) {
        let line = render_line(root, event);
        if let Err(e) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            warn!("Failed to write event line: {e}");
        }
    }
}

#[derive(Serialize)]
struct JsonEvent {
    observed_at: String,
    root: String,
    name: Option<String>,
    events: Vec<&'static str>,
    is_directory: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    watch_removed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    unmounted: bool,
    watch_id: i32,
}

/// JSON-lines output, one object per event
#[derive(Debug)]
pub struct JsonSink<W: Write> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EmitSink for JsonSink<W> {
    fn emit(&mut self, root: &Path, event: &DecodedEvent) {
        let record = JsonEvent {
            observed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            root: root.to_string_lossy().into_owned(),
            name: event
                .name
                .as_ref()
                .map(|n| n.to_string_lossy().into_owned()),
            events: event.activity.labels(),
            is_directory: event.is_directory,
            watch_removed: event.watch_removed,
            unmounted: event.unmounted,
            watch_id: event.watch_id,
        };
        let written = serde_json::to_writer(&mut self.out, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(self.out))
            .and_then(|_| self.out.flush());
        if let Err(e) = written {
            warn!("Failed to write event record: {e}");
        }
    }
}

/// Collects events in memory; used by tests and embedders
#[derive(Debug, Default)]
pub struct VecSink {
    pub events: Vec<(std::path::PathBuf, DecodedEvent)>,
}

impl EmitSink for VecSink {
    fn emit(&mut self, root: &Path, event: &DecodedEvent) {
        self.events.push((root.to_path_buf(), event.clone()));
    }
}

impl<S: EmitSink + ?Sized> EmitSink for Box<S> {
    fn emit(&mut self, root: &Path, event: &DecodedEvent) {
        (**self).emit(root, event)
    }
}
