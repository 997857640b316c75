//! `userfaultfd(2)` write-protect backend.
//!
//! Pages are registered in `UFFDIO_REGISTER_MODE_WP` and write protected
//! with `UFFDIO_WRITEPROTECT`. A write to a protected page blocks the writer
//! and queues a `uffd_msg` on the descriptor; clearing the protection on
//! that page wakes it again.

#![allow(unsafe_code)]

use super::{ArmedRanges, FaultBackend, RawFault};
use crate::error::Error;
use crate::memory::{page_base, page_size};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::{ioctl_read, ioctl_readwrite};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, trace};

const UFFDIO: u8 = 0xAA;
const UFFD_API: u64 = 0xAA;
const UFFD_USER_MODE_ONLY: libc::c_int = 1;

const UFFD_FEATURE_PAGEFAULT_FLAG_WP: u64 = 1 << 0;
const UFFD_FEATURE_THREAD_ID: u64 = 1 << 8;

const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;
const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 1;

const MSG_SIZE: usize = size_of::<UffdMsg>();
const MSGS_PER_READ: usize = 64;

#[repr(C)]
pub(super) struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
pub(super) struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
pub(super) struct UffdioWriteprotect {
    range: UffdioRange,
    mode: u64,
}

/// `struct uffd_msg` with the page fault arm of its union.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    flags: u64,
    address: u64,
    ptid: u32,
    _pad: u32,
}

const _: () = assert!(MSG_SIZE == 32);

ioctl_readwrite!(uffdio_api, UFFDIO, 0x3F, UffdioApi);
ioctl_readwrite!(uffdio_register, UFFDIO, 0x00, UffdioRegister);
ioctl_read!(uffdio_unregister, UFFDIO, 0x01, UffdioRange);
ioctl_readwrite!(uffdio_writeprotect, UFFDIO, 0x06, UffdioWriteprotect);

/// The userfaultfd descriptor plus an eventfd polled next to it, so
/// `wake` can cut a poll short.
#[derive(Debug)]
struct Channel {
    file: File,
    wake: EventFd,
}

#[derive(Debug, Default)]
pub struct UffdBackend {
    channel: OnceLock<Channel>,
    armed: Mutex<ArmedRanges>,
}

impl UffdBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self) -> Result<&Channel, Error> {
        self.channel
            .get()
            .ok_or_else(|| Error::Platform("userfaultfd is not open".into()))
    }

    fn file(&self) -> Result<&File, Error> {
        self.channel().map(|channel| &channel.file)
    }

    fn create_fd() -> Result<OwnedFd, Errno> {
        let base = libc::O_CLOEXEC | libc::O_NONBLOCK;
        // User-mode-only descriptors are allowed without privileges on
        // kernels that restrict unprivileged userfaultfd.
        for flags in [base | UFFD_USER_MODE_ONLY, base] {
            // SAFETY: plain syscall with integer flags.
            let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
            if fd >= 0 {
                // SAFETY: the kernel just handed us this descriptor.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) });
            }
            let errno = Errno::last();
            if errno != Errno::EINVAL {
                return Err(errno);
            }
        }
        Err(Errno::EINVAL)
    }

    fn handshake(file: &File) -> Result<(), Error> {
        let wanted = UFFD_FEATURE_PAGEFAULT_FLAG_WP | UFFD_FEATURE_THREAD_ID;
        let mut api = UffdioApi {
            api: UFFD_API,
            features: wanted,
            ioctls: 0,
        };
        // SAFETY: `api` is a valid uffdio_api for the duration of the call.
        unsafe { uffdio_api(file.as_raw_fd(), &mut api) }
            .map_err(|err| Error::Platform(format!("UFFDIO_API failed: {err}")))?;
        if api.features & wanted != wanted {
            return Err(Error::Platform(format!(
                "kernel lacks write-protect faults with thread ids (features {:#x})",
                api.features
            )));
        }
        Ok(())
    }

    fn protect(&self, base: usize, len: usize, protect: bool) -> Result<(), Errno> {
        let file = self.file().map_err(|_| Errno::EBADF)?;
        let mut wp = UffdioWriteprotect {
            range: UffdioRange {
                start: base as u64,
                len: len as u64,
            },
            mode: if protect { UFFDIO_WRITEPROTECT_MODE_WP } else { 0 },
        };
        // SAFETY: `wp` is a valid uffdio_writeprotect for the call.
        unsafe { uffdio_writeprotect(file.as_raw_fd(), &mut wp) }.map(drop)
    }

    fn parse(buf: &[u8]) -> Vec<RawFault> {
        buf.chunks_exact(MSG_SIZE)
            .filter_map(|chunk| {
                // SAFETY: chunk is exactly MSG_SIZE bytes; the read copes
                // with any alignment.
                let msg = unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<UffdMsg>()) };
                if msg.event != UFFD_EVENT_PAGEFAULT || msg.flags & UFFD_PAGEFAULT_FLAG_WP == 0 {
                    trace!(event = msg.event, flags = msg.flags, "ignoring uffd message");
                    return None;
                }
                Some(RawFault {
                    address: msg.address as usize,
                    thread_id: (msg.ptid != 0).then_some(msg.ptid),
                    instruction_pointer: None,
                })
            })
            .collect()
    }
}

impl FaultBackend for UffdBackend {
    fn name(&self) -> &'static str {
        "userfaultfd"
    }

    fn open(&self) -> Result<(), Error> {
        if self.channel.get().is_some() {
            return Ok(());
        }
        let fd = Self::create_fd().map_err(|err| match err {
            Errno::EPERM => Error::Platform(
                "userfaultfd denied: set vm.unprivileged_userfaultfd=1 or grant CAP_SYS_PTRACE"
                    .into(),
            ),
            Errno::ENOSYS => Error::Platform("kernel built without userfaultfd".into()),
            other => Error::Platform(format!("userfaultfd(2) failed: {other}")),
        })?;
        let file = File::from(fd);
        Self::handshake(&file)?;
        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|err| Error::Platform(format!("eventfd(2) failed: {err}")))?;
        let _ = self.channel.set(Channel { file, wake });
        info!("userfaultfd opened with write-protect faults");
        Ok(())
    }

    fn arm(&self, base: usize, len: usize) -> Result<(), Error> {
        let file = self.file()?;
        let range = UffdioRange {
            start: base as u64,
            len: len as u64,
        };
        let mut register = UffdioRegister {
            range,
            mode: UFFDIO_REGISTER_MODE_WP,
            ioctls: 0,
        };
        // SAFETY: `register` is a valid uffdio_register for the call.
        unsafe { uffdio_register(file.as_raw_fd(), &mut register) }
            .map_err(|err| Error::Platform(format!("UFFDIO_REGISTER {base:#x}+{len}: {err}")))?;

        self.armed.lock().insert(base, len);
        if let Err(err) = self.protect(base, len, true) {
            self.armed.lock().remove(base);
            let mut range = range;
            // SAFETY: undoing the registration made just above.
            let _ = unsafe { uffdio_unregister(file.as_raw_fd(), &mut range) };
            return Err(Error::Platform(format!(
                "UFFDIO_WRITEPROTECT {base:#x}+{len}: {err}"
            )));
        }
        debug!(base = format_args!("{base:#x}"), len, "range armed");
        Ok(())
    }

    fn disarm(&self, base: usize, len: usize) -> Result<(), Error> {
        let file = self.file()?;
        self.armed.lock().remove(base);
        // Dropping protection also wakes threads still blocked on the range.
        let unprotected = self.protect(base, len, false);
        let mut range = UffdioRange {
            start: base as u64,
            len: len as u64,
        };
        // SAFETY: `range` is a valid uffdio_range for the call.
        unsafe { uffdio_unregister(file.as_raw_fd(), &mut range) }
            .map_err(|err| Error::Platform(format!("UFFDIO_UNREGISTER {base:#x}+{len}: {err}")))?;
        unprotected
            .map_err(|err| Error::Platform(format!("UFFDIO_WRITEPROTECT {base:#x}+{len}: {err}")))?;
        debug!(base = format_args!("{base:#x}"), len, "range disarmed");
        Ok(())
    }

    fn poll_faults(&self, timeout: Duration) -> Result<Vec<RawFault>, Error> {
        let channel = self.channel()?;
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [
            PollFd::new(channel.file.as_fd(), PollFlags::POLLIN),
            PollFd::new(channel.wake.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(err) => return Err(Error::Platform(format!("poll on userfaultfd: {err}"))),
        }
        let readable = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN));
        let (faults_ready, woken) = (readable(&fds[0]), readable(&fds[1]));
        if woken {
            let _ = channel.wake.read();
        }
        if !faults_ready {
            return Ok(Vec::new());
        }

        let mut file = &channel.file;
        let mut buf = [0u8; MSG_SIZE * MSGS_PER_READ];
        match file.read(&mut buf) {
            Ok(n) => Ok(Self::parse(&buf[..n])),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(Vec::new())
            }
            Err(err) => Err(Error::Platform(format!("read from userfaultfd: {err}"))),
        }
    }

    fn release(&self, fault: &RawFault) -> Result<(), Error> {
        let page = page_base(fault.address);
        self.protect(page, page_size(), false)
            .map_err(|err| Error::Platform(format!("release {page:#x}: {err}")))
    }

    fn rearm(&self, page: usize) -> Result<(), Error> {
        if !self.armed.lock().contains(page) {
            return Ok(());
        }
        self.protect(page, page_size(), true)
            .map_err(|err| Error::Platform(format!("rearm {page:#x}: {err}")))
    }

    fn wake(&self) -> Result<(), Error> {
        let Some(channel) = self.channel.get() else {
            return Ok(());
        };
        channel
            .wake
            .write(1)
            .map(drop)
            .map_err(|err| Error::Platform(format!("wake fault handler: {err}")))
    }
}
