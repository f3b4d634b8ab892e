//! Event Loop: wait, drain, decode, resolve, emit
//!
//! Two phases only: idle in a readiness wait, then drain the session with
//! non-blocking reads until it would block. Everything after the wait is
//! synchronous.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::decoder::{decode_batch, DecodedEvent, WatchId, MIN_BUFFER_SIZE};
use crate::error::{WatchError, WatchResult};
use crate::registry::WatchRegistry;
use crate::sink::EmitSink;
use crate::source::{NotificationSource, Readiness};

/// What to do with an event whose watch id is not in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownWatchPolicy {
    #[default]
    Fatal,
    Skip,
}

/// Running totals, reported at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub batches: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub overflows: u64,
}

/// Resolution and dispatch half of the loop, kept apart from the read buffer
#[derive(Debug)]
struct Router<K> {
    registry: WatchRegistry,
    sink: K,
    policy: UnknownWatchPolicy,
    removed: HashSet<WatchId>,
    stats: LoopStats,
}

impl<K: EmitSink> Router<K> {
    fn dispatch(&mut self, event: DecodedEvent) -> WatchResult<()> {
        if event.queue_overflow {
            self.stats.overflows += 1;
            warn!("Kernel event queue overflowed, some events were lost");
            return Ok(());
        }
        if !event.is_reportable() {
            debug!("Dropping record with no reportable bits (wd {})", event.watch_id);
            return Ok(());
        }

        let root = match self.registry.resolve(event.watch_id) {
            Ok(root) => root,
            Err(e) if self.policy == UnknownWatchPolicy::Skip => {
                self.stats.skipped += 1;
                warn!("Skipping event: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.sink.emit(root, &event);
        self.stats.emitted += 1;

        if event.watch_removed {
            warn!("Watch on {} was removed by the kernel", root.display());
            self.removed.insert(event.watch_id);
            if self.removed.len() >= self.registry.len() {
                return Err(WatchError::AllWatchesRemoved);
            }
        }
        Ok(())
    }
}

pub struct EventLoop<S, K> {
    source: S,
    buf: Vec<u8>,
    router: Router<K>,
}

impl<S: NotificationSource, K: EmitSink> EventLoop<S, K> {
    /// `buffer_size` is raised to the smallest size that fits one record
    pub fn new(
        source: S,
        registry: WatchRegistry,
        sink: K,
        buffer_size: usize,
        policy: UnknownWatchPolicy,
    ) -> Self {
        Self {
            source,
            buf: vec![0u8; buffer_size.max(MIN_BUFFER_SIZE)],
            router: Router {
                registry,
                sink,
                policy,
                removed: HashSet::new(),
                stats: LoopStats::default(),
            },
        }
    }

    /// Wait and drain until `shutdown` is observed after an interrupted wait
    pub fn run(&mut self, shutdown: &AtomicBool) -> WatchResult<LoopStats> {
        info!("Listening for events.");
        while !shutdown.load(Ordering::SeqCst) {
            match self.source.wait_readable() {
                Ok(Readiness::Ready) => self.drain()?,
                Ok(Readiness::Interrupted) => debug!("Readiness wait interrupted"),
                Err(e) => return Err(WatchError::ReadinessWait(e)),
            }
        }
        info!("Listening for events stopped.");
        Ok(self.router.stats)
    }

    /// Read and dispatch batches until the session has nothing more to give
    pub fn drain(&mut self) -> WatchResult<()> {
        loop {
            let len = match self.source.read_nonblocking(&mut self.buf) {
                Ok(0) => return Ok(()),
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WatchError::Read(e)),
            };
            self.router.stats.batches += 1;
            debug!("Read {len} byte batch");

            for event in decode_batch(&self.buf, len) {
                self.router.dispatch(event?)?;
            }
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.router.stats
    }

    pub fn sink(&self) -> &K {
        &self.router.sink
    }

    pub fn into_sink(self) -> K {
        self.router.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::record;
    use crate::decoder::{
        IN_CLOSE_NOWRITE, IN_IGNORED, IN_ISDIR, IN_OPEN, IN_Q_OVERFLOW, IN_UNMOUNT,
    };
    use crate::sink::tests::BrokenPipe;
    use crate::sink::{TextSink, VecSink};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Arc;

    /// Replays scripted waits and reads. Once the waits run out it requests
    /// shutdown and reports an interrupted wait, like a SIGTERM would.
    struct ScriptedSource {
        waits: VecDeque<io::Result<Readiness>>,
        reads: VecDeque<io::Result<Vec<u8>>>,
        shutdown: Arc<AtomicBool>,
        next_id: WatchId,
    }

    impl ScriptedSource {
        fn new(shutdown: Arc<AtomicBool>) -> Self {
            Self {
                waits: VecDeque::new(),
                reads: VecDeque::new(),
                shutdown,
                next_id: 1,
            }
        }
    }

    impl NotificationSource for ScriptedSource {
        fn add_watch(&mut self, _path: &Path, _mask: u32) -> io::Result<WatchId> {
            let id = self.next_id;
            self.next_id += 1;
            Ok(id)
        }

        fn wait_readable(&mut self) -> io::Result<Readiness> {
            match self.waits.pop_front() {
                Some(step) => step,
                None => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    Ok(Readiness::Interrupted)
                }
            }
        }

        fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    fn build(
        roots: &[&str],
        policy: UnknownWatchPolicy,
    ) -> (EventLoop<ScriptedSource, VecSink>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource::new(shutdown.clone());
        let mut registry = WatchRegistry::new();
        for root in roots {
            registry.register(&mut source, Path::new(root)).unwrap();
        }
        let event_loop = EventLoop::new(source, registry, VecSink::default(), 4096, policy);
        (event_loop, shutdown)
    }

    #[test]
    fn test_drain_reads_until_would_block() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source.reads.push_back(Ok(record(1, IN_OPEN, b"a\0\0\0")));
        el.source.reads.push_back(Ok(record(1, IN_CLOSE_NOWRITE, b"a\0\0\0")));

        el.drain().unwrap();

        let sink = el.sink();
        assert_eq!(sink.events.len(), 2);
        assert!(sink.events[0].1.opened());
        assert!(sink.events[1].1.closed_without_write());
        assert_eq!(el.stats().batches, 2);
        assert_eq!(el.stats().emitted, 2);
    }

    #[test]
    fn test_drain_retries_interrupted_read() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source.reads.push_back(Err(io::ErrorKind::Interrupted.into()));
        el.source.reads.push_back(Ok(record(1, IN_OPEN, b"")));

        el.drain().unwrap();
        assert_eq!(el.sink().events.len(), 1);
    }

    #[test]
    fn test_zero_byte_read_ends_drain() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source.reads.push_back(Ok(Vec::new()));
        el.source.reads.push_back(Ok(record(1, IN_OPEN, b"")));

        el.drain().unwrap();
        assert!(el.sink().events.is_empty());
        assert_eq!(el.source.reads.len(), 1);
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source
            .reads
            .push_back(Err(io::Error::from_raw_os_error(libc::EBADF)));

        assert!(matches!(el.drain(), Err(WatchError::Read(_))));
    }

    #[test]
    fn test_corrupt_batch_is_fatal() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Skip);
        let mut bytes = record(1, IN_OPEN, b"name\0\0\0\0");
        bytes.truncate(20);
        el.source.reads.push_back(Ok(bytes));

        assert!(matches!(el.drain(), Err(WatchError::Decode { .. })));
    }

    #[test]
    fn test_unknown_watch_fatal_by_default() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source.reads.push_back(Ok(record(99, IN_OPEN, b"")));

        assert!(matches!(el.drain(), Err(WatchError::UnknownWatch(99))));
    }

    #[test]
    fn test_unknown_watch_skipped_when_configured() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Skip);
        let mut bytes = record(99, IN_OPEN, b"");
        bytes.extend(record(1, IN_OPEN, b"ok\0\0"));
        el.source.reads.push_back(Ok(bytes));

        el.drain().unwrap();
        assert_eq!(el.sink().events.len(), 1);
        assert_eq!(el.stats().skipped, 1);
    }

    #[test]
    fn test_queue_overflow_is_not_resolved() {
        let (mut el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        let mut bytes = record(-1, IN_Q_OVERFLOW, b"");
        bytes.extend(record(1, IN_OPEN, b""));
        el.source.reads.push_back(Ok(bytes));

        el.drain().unwrap();
        assert_eq!(el.stats().overflows, 1);
        assert_eq!(el.sink().events.len(), 1);
    }

    #[test]
    fn test_events_resolve_to_their_own_root() {
        let (mut el, _) = build(&["/tmp", "/var/log"], UnknownWatchPolicy::Fatal);
        let mut bytes = record(2, IN_OPEN, b"syslog\0\0");
        bytes.extend(record(1, IN_OPEN, b"x\0\0\0"));
        el.source.reads.push_back(Ok(bytes));

        el.drain().unwrap();
        let roots: Vec<_> = el.sink().events.iter().map(|(r, _)| r.clone()).collect();
        assert_eq!(roots, vec![Path::new("/var/log"), Path::new("/tmp")]);
    }

    #[test]
    fn test_last_watch_removed_ends_loop() {
        let (mut el, _) = build(&["/tmp", "/srv"], UnknownWatchPolicy::Fatal);
        el.source.reads.push_back(Ok(record(1, IN_IGNORED, b"")));
        el.drain().unwrap();
        assert_eq!(el.sink().events.len(), 1);

        el.source.reads.push_back(Ok(record(2, IN_IGNORED, b"")));
        assert!(matches!(el.drain(), Err(WatchError::AllWatchesRemoved)));
    }

    #[test]
    fn test_run_retries_interrupt_then_shuts_down() {
        let (mut el, shutdown) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source.waits.push_back(Ok(Readiness::Interrupted));
        el.source.waits.push_back(Ok(Readiness::Ready));
        el.source.reads.push_back(Ok(record(1, IN_OPEN, b"")));

        let stats = el.run(&shutdown).unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.batches, 1);
    }

    #[test]
    fn test_run_wait_failure_is_fatal() {
        let (mut el, shutdown) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        el.source
            .waits
            .push_back(Err(io::Error::from_raw_os_error(libc::EINVAL)));

        assert!(matches!(el.run(&shutdown), Err(WatchError::ReadinessWait(_))));
    }

    #[test]
    fn test_small_buffer_is_raised_to_minimum() {
        let (el, _) = build(&["/tmp"], UnknownWatchPolicy::Fatal);
        let el = EventLoop::new(
            el.source,
            WatchRegistry::new(),
            VecSink::default(),
            8,
            UnknownWatchPolicy::Fatal,
        );
        assert_eq!(el.buf.len(), MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_unmount_is_emitted_and_bare_records_dropped() {
        let (mut el, _) = build(&["/mnt/usb"], UnknownWatchPolicy::Fatal);
        let mut bytes = record(1, IN_ISDIR, b"");
        bytes.extend(record(1, IN_UNMOUNT | IN_ISDIR, b""));
        el.source.reads.push_back(Ok(bytes));

        el.drain().unwrap();
        let sink = el.sink();
        assert_eq!(sink.events.len(), 1);
        assert!(sink.events[0].1.unmounted);
        assert_eq!(el.stats().emitted, 1);
    }

    #[test]
    fn test_drain_survives_failing_sink() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource::new(shutdown);
        let mut registry = WatchRegistry::new();
        registry.register(&mut source, Path::new("/tmp")).unwrap();
        let mut bytes = record(1, IN_OPEN, b"a\0\0\0");
        bytes.extend(record(1, IN_CLOSE_NOWRITE, b"a\0\0\0"));
        source.reads.push_back(Ok(bytes));

        let mut el = EventLoop::new(
            source,
            registry,
            TextSink::new(BrokenPipe::default()),
            4096,
            UnknownWatchPolicy::Fatal,
        );
        el.drain().unwrap();

        assert_eq!(el.stats().emitted, 2);
        assert_eq!(el.into_sink().into_inner().attempts, 2);
    }
}
