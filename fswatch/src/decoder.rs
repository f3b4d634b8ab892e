//! inotify record decoder
//!
//! A read from an inotify descriptor returns zero or more records packed
//! back-to-back. Each record is a fixed 16-byte header followed by `len`
//! bytes of name field:
//!
//! ```text
//! struct inotify_event {
//!     int      wd;      // watch descriptor
//!     uint32_t mask;    // activity bits
//!     uint32_t cookie;  // rename pairing, unused here
//!     uint32_t len;     // size of name field, padding included
//!     char     name[];  // NUL-terminated, NUL-padded
//! };
//! ```
//!
//! The next record always starts `HEADER_SIZE + len` bytes after the current
//! one. Every advance here is checked against the valid length of the batch.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use bitflags::bitflags;

use crate::error::WatchError;

/// Size of the fixed record header in bytes
pub const HEADER_SIZE: usize = 16;

/// Longest file name the kernel will put in a record (NAME_MAX)
pub const NAME_MAX: usize = 255;

/// Smallest read buffer guaranteed to hold one complete record
pub const MIN_BUFFER_SIZE: usize = HEADER_SIZE + NAME_MAX + 1;

// Kernel ABI mask bits (linux/inotify.h)
pub const IN_CLOSE_WRITE: u32 = 0x0000_0008;
pub const IN_CLOSE_NOWRITE: u32 = 0x0000_0010;
pub const IN_OPEN: u32 = 0x0000_0020;
pub const IN_UNMOUNT: u32 = 0x0000_2000;
pub const IN_Q_OVERFLOW: u32 = 0x0000_4000;
pub const IN_IGNORED: u32 = 0x0000_8000;
pub const IN_ISDIR: u32 = 0x4000_0000;

/// Activity kinds this observer registers for
pub const WATCH_MASK: u32 = IN_OPEN | IN_CLOSE_WRITE | IN_CLOSE_NOWRITE;

/// Opaque watch handle handed out by the notification subsystem
pub type WatchId = i32;

bitflags! {
    /// Activity kinds carried by one record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Activity: u32 {
        const OPENED = IN_OPEN;
        const CLOSED_AFTER_WRITE = IN_CLOSE_WRITE;
        const CLOSED_WITHOUT_WRITE = IN_CLOSE_NOWRITE;
    }
}

impl Activity {
    /// Kernel-style labels in the order they are rendered
    pub fn labels(self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.contains(Activity::OPENED) {
            labels.push("IN_OPEN");
        }
        if self.contains(Activity::CLOSED_WITHOUT_WRITE) {
            labels.push("IN_CLOSE_NOWRITE");
        }
        if self.contains(Activity::CLOSED_AFTER_WRITE) {
            labels.push("IN_CLOSE_WRITE");
        }
        labels
    }
}

/// Fixed-size prefix of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecordHeader {
    pub watch_id: WatchId,
    pub mask: u32,
    pub cookie: u32,
    pub name_len: u32,
}

impl RawRecordHeader {
    /// Parse a header from exactly `HEADER_SIZE` bytes (native endian)
    fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        Self {
            watch_id: i32::from_ne_bytes(word(0)),
            mask: u32::from_ne_bytes(word(4)),
            cookie: u32::from_ne_bytes(word(8)),
            name_len: u32::from_ne_bytes(word(12)),
        }
    }

    /// Serialize back to the kernel layout
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.watch_id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.mask.to_ne_bytes());
        out[8..12].copy_from_slice(&self.cookie.to_ne_bytes());
        out[12..16].copy_from_slice(&self.name_len.to_ne_bytes());
        out
    }
}

/// One decoded activity record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub watch_id: WatchId,
    pub activity: Activity,
    pub is_directory: bool,
    /// Kernel dropped events because its queue filled up
    pub queue_overflow: bool,
    /// Kernel removed the watch (root deleted or unmounted)
    pub watch_removed: bool,
    /// Filesystem holding the root was unmounted; IN_IGNORED follows
    pub unmounted: bool,
    /// Entry name inside the root; `None` when the event is about the root
    pub name: Option<OsString>,
}

impl DecodedEvent {
    fn from_record(header: RawRecordHeader, name_field: &[u8]) -> Self {
        let mask = header.mask;
        Self {
            watch_id: header.watch_id,
            activity: Activity::from_bits_truncate(mask),
            is_directory: mask & IN_ISDIR != 0,
            queue_overflow: mask & IN_Q_OVERFLOW != 0,
            watch_removed: mask & IN_IGNORED != 0,
            unmounted: mask & IN_UNMOUNT != 0,
            name: trim_name(name_field),
        }
    }

    pub fn opened(&self) -> bool {
        self.activity.contains(Activity::OPENED)
    }

    pub fn closed_after_write(&self) -> bool {
        self.activity.contains(Activity::CLOSED_AFTER_WRITE)
    }

    pub fn closed_without_write(&self) -> bool {
        self.activity.contains(Activity::CLOSED_WITHOUT_WRITE)
    }

    /// Whether any bit worth reporting downstream is set
    pub fn is_reportable(&self) -> bool {
        !self.activity.is_empty() || self.watch_removed || self.unmounted
    }
}

/// Cut the name field at its first NUL; an empty result means no name
fn trim_name(field: &[u8]) -> Option<OsString> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    if end == 0 {
        None
    } else {
        Some(OsStr::from_bytes(&field[..end]).to_os_string())
    }
}

/// Lazy iterator over the records of one batch.
///
/// Yields `Err` at most once, then stops.
#[derive(Debug)]
pub struct RecordIter<'a> {
    buf: &'a [u8],
    cursor: usize,
    failed: bool,
}

/// Decode the first `valid_len` bytes of `buf`
pub fn decode_batch(buf: &[u8], valid_len: usize) -> RecordIter<'_> {
    match buf.get(..valid_len) {
        Some(valid) => RecordIter {
            buf: valid,
            cursor: 0,
            failed: false,
        },
        // Report the bad length on the first call to next()
        None => RecordIter {
            buf,
            cursor: valid_len,
            failed: false,
        },
    }
}

impl<'a> RecordIter<'a> {
    fn corrupt(&mut self, needed: usize) -> Option<Result<DecodedEvent, WatchError>> {
        self.failed = true;
        Some(Err(WatchError::Decode {
            offset: self.cursor,
            needed,
            available: self.buf.len().saturating_sub(self.cursor),
        }))
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<DecodedEvent, WatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor == self.buf.len() {
            return None;
        }
        if self.cursor > self.buf.len() {
            return self.corrupt(0);
        }

        let rest = &self.buf[self.cursor..];
        let header_bytes: &[u8; HEADER_SIZE] = match rest.get(..HEADER_SIZE) {
            Some(bytes) => bytes.try_into().ok()?,
            None => return self.corrupt(HEADER_SIZE),
        };
        let header = RawRecordHeader::parse(header_bytes);

        let stride = match usize::try_from(header.name_len)
            .ok()
            .and_then(|len| len.checked_add(HEADER_SIZE))
        {
            Some(stride) => stride,
            None => return self.corrupt(usize::MAX),
        };
        let name_field = match rest.get(HEADER_SIZE..stride) {
            Some(field) => field,
            None => return self.corrupt(stride),
        };

        let event = DecodedEvent::from_record(header, name_field);
        self.cursor += stride;
        Some(Ok(event))
    }
}
