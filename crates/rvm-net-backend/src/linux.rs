//! Kernel TAP backend: a `/dev/net/tun` device plus a self-pipe so a blocked
//! `poll` can be woken by another thread.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use tracing::debug;

use crate::{PollEvents, Tap, TapError};

pub struct LinuxTap {
    tap: OwnedFd,
    wake_rd: OwnedFd,
    wake_wr: OwnedFd,
    name: String,
}

fn check(ret: libc::c_int) -> Result<libc::c_int, TapError> {
    if ret < 0 {
        Err(TapError::Io(io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

impl LinuxTap {
    /// Open a TAP interface; `None` lets the kernel pick a `tapN` name.
    pub fn open(name: Option<&str>) -> Result<Self, TapError> {
        let fd = check(unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        })?;
        // SAFETY: freshly opened, owned from here on.
        let tap = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        if let Some(name) = name {
            let bytes = name.as_bytes();
            if bytes.len() >= req.ifr_name.len() {
                return Err(TapError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "interface name too long",
                )));
            }
            for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
        }
        req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
        check(unsafe { libc::ioctl(tap.as_raw_fd(), libc::TUNSETIFF as _, &mut req) })?;
        // SAFETY: the kernel NUL-terminates the accepted name.
        let name = unsafe { CStr::from_ptr(req.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut pipe = [0 as libc::c_int; 2];
        check(unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) })?;
        // SAFETY: both ends are ours.
        let (wake_rd, wake_wr) =
            unsafe { (OwnedFd::from_raw_fd(pipe[0]), OwnedFd::from_raw_fd(pipe[1])) };

        debug!("opened tap interface {name}");
        Ok(Self {
            tap,
            wake_rd,
            wake_wr,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn named_request(&self) -> libc::ifreq {
        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(self.name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        req
    }

    fn ctl_socket() -> Result<OwnedFd, TapError> {
        let fd = check(unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0)
        })?;
        // SAFETY: freshly created.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl Tap for LinuxTap {
    fn poll(&self, interest: PollEvents, timeout: Option<Duration>) -> Result<PollEvents, TapError> {
        let mut events: libc::c_short = 0;
        if interest.contains(PollEvents::IN) {
            events |= libc::POLLIN;
        }
        if interest.contains(PollEvents::OUT) {
            events |= libc::POLLOUT;
        }
        let mut fds = [
            libc::pollfd {
                fd: self.tap.as_raw_fd(),
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_rd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        loop {
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TapError::Io(err));
            }
        }

        if fds[1].revents & libc::POLLIN != 0 {
            // Drain every pending wake byte; stickiness lives in the pipe.
            let mut sink = [0u8; 64];
            while unsafe {
                libc::read(
                    self.wake_rd.as_raw_fd(),
                    sink.as_mut_ptr().cast(),
                    sink.len(),
                )
            } > 0
            {}
        }

        let mut ready = PollEvents::empty();
        if fds[0].revents & libc::POLLIN != 0 {
            ready |= PollEvents::IN;
        }
        if fds[0].revents & libc::POLLOUT != 0 {
            ready |= PollEvents::OUT;
        }
        Ok(ready)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TapError> {
        let n = unsafe { libc::read(self.tap.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(TapError::WouldBlock);
            }
            return Err(TapError::Io(err));
        }
        Ok(n as usize)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, TapError> {
        let n = unsafe { libc::write(self.tap.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(TapError::WouldBlock);
            }
            return Err(TapError::Io(err));
        }
        Ok(n as usize)
    }

    fn wake(&self) {
        // A full pipe already carries a pending wake; EAGAIN is fine.
        let byte = 1u8;
        unsafe {
            libc::write(self.wake_wr.as_raw_fd(), (&byte as *const u8).cast(), 1);
        }
    }

    fn mac(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        let Ok(sock) = Self::ctl_socket() else {
            return mac;
        };
        let mut req = self.named_request();
        let ret =
            unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFHWADDR as _, &mut req) };
        if ret >= 0 {
            let data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
            for (dst, src) in mac.iter_mut().zip(data.iter()) {
                *dst = *src as u8;
            }
        }
        mac
    }

    fn set_mac(&self, mac: [u8; 6]) {
        let Ok(sock) = Self::ctl_socket() else {
            return;
        };
        let mut req = self.named_request();
        req.ifr_ifru.ifru_hwaddr.sa_family = libc::ARPHRD_ETHER;
        for (dst, src) in unsafe { &mut req.ifr_ifru.ifru_hwaddr.sa_data }
            .iter_mut()
            .zip(mac)
        {
            *dst = src as libc::c_char;
        }
        let ret =
            unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFHWADDR as _, &mut req) };
        if ret < 0 {
            debug!(
                "failed to set mac on {}: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }

    fn link_up(&self) -> bool {
        let Ok(sock) = Self::ctl_socket() else {
            return false;
        };
        let mut req = self.named_request();
        let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut req) };
        if ret < 0 {
            return false;
        }
        let flags = unsafe { req.ifr_ifru.ifru_flags } as libc::c_int;
        flags & libc::IFF_RUNNING != 0
    }
}
