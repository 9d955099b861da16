//! Readiness multiplexer over Linux epoll.
//!
//! Handles are registered for read readiness only. In `oneshot` mode a handle
//! is disarmed after it fires and must be re-armed once its read completes,
//! which guarantees at most one readiness event (and so at most one read) per
//! connection at a time. In `edge` mode the kernel reports every new arrival;
//! events that land while a read is in flight are ignored by the event loop,
//! so `rearm` still issues `EPOLL_CTL_MOD`, which re-reports data that is
//! already queued.

use crate::netio::config::ReadinessMode;
use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Registration and wait operations the event loop needs from a readiness
/// source.
pub trait Readiness: Send + Sync {
    /// Register `fd` for read readiness.
    fn add(&self, fd: RawFd) -> io::Result<()>;

    /// Deregister `fd`. Removing an unknown handle succeeds.
    fn remove(&self, fd: RawFd) -> io::Result<()>;

    /// Re-enable a handle after its read completed.
    fn rearm(&self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` (forever when `None`) and append ready handles to
    /// `ready`. Each handle appears at most once per call. An interrupted
    /// wait returns `Ok` with nothing appended.
    fn wait(&self, ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<()>;
}

impl<T: Readiness + ?Sized> Readiness for Arc<T> {
    fn add(&self, fd: RawFd) -> io::Result<()> {
        (**self).add(fd)
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        (**self).remove(fd)
    }

    fn rearm(&self, fd: RawFd) -> io::Result<()> {
        (**self).rearm(fd)
    }

    fn wait(&self, ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<()> {
        (**self).wait(ready, timeout)
    }
}

/// An epoll instance.
pub struct Epoll {
    epfd: OwnedFd,
    mode: ReadinessMode,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl Epoll {
    pub fn new(mode: ReadinessMode, max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 returned a fresh descriptor we now own.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            epfd,
            mode,
            events: Mutex::new(vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)]),
        })
    }

    pub fn mode(&self) -> ReadinessMode {
        self.mode
    }

    fn interest(&self) -> u32 {
        let base = libc::EPOLLIN | libc::EPOLLRDHUP;
        let flags = match self.mode {
            // Ring-only loops never add handles; oneshot is the safe fallback.
            ReadinessMode::Oneshot | ReadinessMode::Ring => base | libc::EPOLLONESHOT,
            ReadinessMode::Edge => base | libc::EPOLLET,
        };
        flags as u32
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: self.interest(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Readiness for Epoll {
    fn add(&self, fd: RawFd) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd)
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => Ok(()),
                _ => Err(err),
            }
        } else {
            Ok(())
        }
    }

    fn rearm(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd)
    }

    fn wait(&self, ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let mut events = self.events.lock();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }

        let start = ready.len();
        for event in events.iter().take(n as usize) {
            // Copy out of the (packed on x86_64) struct before use.
            let data = event.u64;
            ready.push(data as RawFd);
        }
        ready[start..].sort_unstable();
        let mut unique = ready.split_off(start);
        unique.dedup();
        ready.extend(unique);
        Ok(())
    }
}

impl std::fmt::Debug for Epoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoll")
            .field("fd", &self.epfd.as_raw_fd())
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_ready_after_write() {
        let epoll = Epoll::new(ReadinessMode::Oneshot, 16).unwrap();
        let (reader, mut writer) = pair();
        epoll.add(reader.as_raw_fd()).unwrap();

        let mut ready = Vec::new();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());

        writer.write_all(b"x").unwrap();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![reader.as_raw_fd()]);
    }

    #[test]
    fn test_oneshot_fires_once_until_rearmed() {
        let epoll = Epoll::new(ReadinessMode::Oneshot, 16).unwrap();
        let (reader, mut writer) = pair();
        let fd = reader.as_raw_fd();
        epoll.add(fd).unwrap();
        writer.write_all(b"x").unwrap();

        let mut ready = Vec::new();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![fd]);

        // Data is still unread but the registration is disarmed.
        ready.clear();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());

        epoll.rearm(fd).unwrap();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![fd]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let epoll = Epoll::new(ReadinessMode::Edge, 16).unwrap();
        let (reader, mut writer) = pair();
        let fd = reader.as_raw_fd();
        epoll.add(fd).unwrap();
        epoll.remove(fd).unwrap();
        epoll.remove(fd).unwrap();

        writer.write_all(b"x").unwrap();
        let mut ready = Vec::new();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_add_invalid_handle_fails() {
        let epoll = Epoll::new(ReadinessMode::Oneshot, 16).unwrap();
        assert!(epoll.add(-1).is_err());
    }

    #[test]
    fn test_add_twice_fails() {
        let epoll = Epoll::new(ReadinessMode::Oneshot, 16).unwrap();
        let (reader, _writer) = pair();
        epoll.add(reader.as_raw_fd()).unwrap();
        assert!(epoll.add(reader.as_raw_fd()).is_err());
    }

    #[test]
    fn test_peer_close_reports_ready() {
        let epoll = Epoll::new(ReadinessMode::Oneshot, 16).unwrap();
        let (reader, writer) = pair();
        epoll.add(reader.as_raw_fd()).unwrap();
        drop(writer);

        let mut ready = Vec::new();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![reader.as_raw_fd()]);
    }

    #[test]
    fn test_edge_rearm_reports_queued_data() {
        let epoll = Epoll::new(ReadinessMode::Edge, 16).unwrap();
        let (reader, mut writer) = pair();
        let fd = reader.as_raw_fd();
        epoll.add(fd).unwrap();
        writer.write_all(b"x").unwrap();

        let mut ready = Vec::new();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![fd]);

        // No new arrival, no new edge.
        ready.clear();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());

        epoll.rearm(fd).unwrap();
        epoll.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![fd]);
        assert_eq!(epoll.mode(), ReadinessMode::Edge);
    }

    #[test]
    fn test_rearm_unknown_handle_fails() {
        let epoll = Epoll::new(ReadinessMode::Oneshot, 16).unwrap();
        let (reader, _writer) = pair();
        assert!(epoll.rearm(reader.as_raw_fd()).is_err());
    }
}
