//! Notification subsystem seam
//!
//! The event loop only needs four things from the kernel: register a path,
//! wait until data is readable, read without blocking, and release the
//! session. `NotificationSource` captures that contract; `InotifySession` is
//! the Linux implementation.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{poll, ppoll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::SigSet;
use tracing::debug;

use crate::decoder::WatchId;

/// Outcome of one readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A signal arrived before any data did
    Interrupted,
}

pub trait NotificationSource {
    /// Begin observing `path` for the activity bits in `mask`
    fn add_watch(&mut self, path: &Path, mask: u32) -> io::Result<WatchId>;

    /// Block with no timeout until the session is readable or a signal lands
    fn wait_readable(&mut self) -> io::Result<Readiness>;

    /// Non-blocking read into `buf`; `WouldBlock` when drained
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Owned inotify descriptor, closed on drop
#[derive(Debug)]
pub struct InotifySession {
    file: File,
    /// Signal mask installed only for the duration of each wait
    wait_mask: Option<SigSet>,
}

impl InotifySession {
    /// Open a non-blocking, close-on-exec inotify session
    pub fn open() -> io::Result<Self> {
        // SAFETY: inotify_init1 takes no pointers; the result is checked below
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by inotify_init1 and is owned by nobody else
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!("inotify session opened (fd {fd})");
        Ok(Self {
            file: File::from(owned),
            wait_mask: None,
        })
    }

    /// Wait with `mask` as the signal mask instead of the thread's own.
    ///
    /// Shutdown signals blocked by the caller and left out of `mask` can
    /// only be delivered inside the wait, so a flag set by their handler is
    /// never missed between the flag check and the wait.
    pub fn with_signal_mask(mut self, mask: SigSet) -> Self {
        self.wait_mask = Some(mask);
        self
    }
}

impl AsFd for InotifySession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl NotificationSource for InotifySession {
    fn add_watch(&mut self, path: &Path, mask: u32) -> io::Result<WatchId> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: the fd is owned by self and c_path is a NUL-terminated string
        // that outlives the call
        let wd = unsafe { libc::inotify_add_watch(self.file.as_raw_fd(), c_path.as_ptr(), mask) };
        if wd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(wd)
    }

    fn wait_readable(&mut self) -> io::Result<Readiness> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let outcome = match self.wait_mask {
            Some(mask) => ppoll(&mut fds, None, Some(mask)),
            None => poll(&mut fds, PollTimeout::NONE),
        };
        match outcome {
            Ok(_) => Ok(Readiness::Ready),
            Err(Errno::EINTR) => Ok(Readiness::Interrupted),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
