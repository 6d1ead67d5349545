//! Single-threaded event pool.
//!
//! One epoll instance owns every timer, file-descriptor watch and deferred
//! event of its component. Timers are one-shot timerfds, one per slot:
//! re-arming a slot replaces the previous deadline, so a component can never
//! have two timers pending on the same slot. Events that became ready in the
//! same wakeup are handed out in registration order.
//!
//! Pools nest: [`EventPool::as_raw_fd`] can itself be registered with an
//! outer pool, which then wakes up whenever any inner source is ready.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::CoreError;

enum SourceKind {
    /// One-shot timer, owned by the pool.
    Timer(OwnedFd),
    /// Externally owned descriptor, watched for readability.
    Fd(RawFd),
}

struct Source<E> {
    ev: E,
    seq: u64,
    kind: SourceKind,
}

pub struct EventPool<E> {
    epfd: OwnedFd,
    sources: Vec<Option<Source<E>>>,
    deferred: VecDeque<E>,
    seq: u64,
}

impl<E: Copy + Eq> EventPool<E> {
    pub fn new() -> Result<Self, CoreError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(CoreError::last_os("epoll_create1"));
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            sources: Vec::new(),
            deferred: VecDeque::new(),
            seq: 0,
        })
    }

    fn register(&mut self, fd: RawFd, src: Source<E>) -> Result<(), CoreError> {
        let slot = self
            .sources
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.sources.push(None);
                self.sources.len() - 1
            });
        let mut evt = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: slot as u64,
        };
        let r = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut evt)
        };
        if r < 0 {
            return Err(CoreError::last_os("epoll_ctl add"));
        }
        self.sources[slot] = Some(src);
        Ok(())
    }

    fn unregister(&mut self, slot: usize) {
        if let Some(src) = self.sources[slot].take() {
            let fd = match &src.kind {
                SourceKind::Timer(tfd) => tfd.as_raw_fd(),
                SourceKind::Fd(fd) => *fd,
            };
            unsafe {
                libc::epoll_ctl(
                    self.epfd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                );
            }
        }
    }

    /// Arm a one-shot timer firing `ev` after `after`. An already-armed
    /// timer for the same event is replaced.
    pub fn add_timer(&mut self, after: Duration, ev: E) -> Result<(), CoreError> {
        self.del_timer(ev);

        let tfd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if tfd < 0 {
            return Err(CoreError::last_os("timerfd_create"));
        }
        let tfd = unsafe { OwnedFd::from_raw_fd(tfd) };

        // an all-zero it_value disarms; a zero delay still has to fire
        let mut nsec = after.subsec_nanos() as libc::c_long;
        if after.as_secs() == 0 && nsec == 0 {
            nsec = 1;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: after.as_secs() as libc::time_t,
                tv_nsec: nsec,
            },
        };
        let r = unsafe {
            libc::timerfd_settime(tfd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if r < 0 {
            return Err(CoreError::last_os("timerfd_settime"));
        }

        let raw = tfd.as_raw_fd();
        self.seq += 1;
        self.register(
            raw,
            Source {
                ev,
                seq: self.seq,
                kind: SourceKind::Timer(tfd),
            },
        )
    }

    /// Drop the timer for `ev`, if armed.
    pub fn del_timer(&mut self, ev: E) {
        let slot = self.sources.iter().position(|s| {
            matches!(s, Some(Source { ev: e, kind: SourceKind::Timer(_), .. }) if *e == ev)
        });
        if let Some(slot) = slot {
            self.unregister(slot);
        }
    }

    /// Watch `fd` for readability; the pool does not take ownership.
    pub fn add_fd(&mut self, fd: RawFd, ev: E) -> Result<(), CoreError> {
        self.seq += 1;
        self.register(
            fd,
            Source {
                ev,
                seq: self.seq,
                kind: SourceKind::Fd(fd),
            },
        )
    }

    pub fn del_fd(&mut self, fd: RawFd) {
        let slot = self.sources.iter().position(|s| {
            matches!(s, Some(Source { kind: SourceKind::Fd(f), .. }) if *f == fd)
        });
        if let Some(slot) = slot {
            self.unregister(slot);
        }
    }

    /// Queue `ev` to be returned by the next [`poll`](Self::poll), ahead of
    /// any I/O. Deferred events preserve FIFO order.
    pub fn defer(&mut self, ev: E) {
        self.deferred.push_back(ev);
    }

    /// Remove every timer, watch and deferred event.
    pub fn remove_all(&mut self) {
        for slot in 0..self.sources.len() {
            self.unregister(slot);
        }
        self.deferred.clear();
    }

    /// Wait for events. `None` blocks until something is ready.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<E>, CoreError> {
        let mut out: Vec<E> = self.deferred.drain(..).collect();

        let timeout_ms: libc::c_int = if !out.is_empty() {
            0
        } else {
            match timeout {
                Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
                None => -1,
            }
        };

        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; 64];
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                raw.as_mut_ptr(),
                raw.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(out);
            }
            return Err(CoreError::from(err));
        }

        let mut ready: Vec<(u64, E, Option<usize>)> = Vec::new();
        for evt in raw.iter().take(n as usize) {
            let slot = evt.u64 as usize;
            let Some(src) = self.sources.get(slot).and_then(Option::as_ref) else {
                continue;
            };
            match &src.kind {
                SourceKind::Timer(tfd) => {
                    let mut expirations = [0u8; 8];
                    unsafe {
                        libc::read(
                            tfd.as_raw_fd(),
                            expirations.as_mut_ptr().cast(),
                            expirations.len(),
                        );
                    }
                    ready.push((src.seq, src.ev, Some(slot)));
                }
                SourceKind::Fd(_) => ready.push((src.seq, src.ev, None)),
            }
        }

        // equal wakeups dispatch in registration order
        ready.sort_by_key(|(seq, _, _)| *seq);
        for (_, ev, expired_timer) in ready {
            if let Some(slot) = expired_timer {
                self.unregister(slot);
            }
            out.push(ev);
        }

        Ok(out)
    }
}

impl<E> AsRawFd for EventPool<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

/// Blocked-signal drain via signalfd.
pub struct SignalWatch {
    fd: OwnedFd,
}

impl SignalWatch {
    /// Block `signals` for the whole process and return a descriptor that
    /// becomes readable when one arrives.
    pub fn block(signals: &[libc::c_int]) -> Result<Self, CoreError> {
        let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            for &sig in signals {
                libc::sigaddset(&mut mask, sig);
            }
            if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) < 0 {
                return Err(CoreError::last_os("sigprocmask"));
            }
        }
        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(CoreError::last_os("signalfd"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Read one pending signal, or `None` when the queue is drained.
    pub fn read(&self) -> Result<Option<u32>, CoreError> {
        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut info as *mut libc::signalfd_siginfo).cast(),
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(CoreError::from(err));
        }
        if n as usize != std::mem::size_of::<libc::signalfd_siginfo>() {
            return Err(CoreError::io("short signalfd read"));
        }
        Ok(Some(info.ssi_signo))
    }
}

impl AsRawFd for SignalWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
