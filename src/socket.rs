use std::{
    io, mem,
    net::Ipv4Addr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// An IPv4 raw socket that receives complete TCP datagrams, IP header included.
///
/// The descriptor is closed when the socket is dropped.
#[derive(Debug)]
pub struct RawSocket {
    fd: OwnedFd,
}

impl RawSocket {
    /// Opens a new raw socket. Requires root or `CAP_NET_RAW`.
    pub fn open() -> io::Result<RawSocket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RawSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Binds the socket to a local address. `0.0.0.0` accepts datagrams for every local address.
    pub fn bind(&self, addr: Ipv4Addr) -> io::Result<()> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 0;
        sin.sin_addr.s_addr = u32::from(addr).to_be();

        let ret = unsafe {
            libc::bind(
                self.as_raw_fd(),
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Bounds how long [`RawSocket::recv`] blocks. Expiry surfaces as `WouldBlock`.
    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a datagram arrives and copies it into `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Wakes up any thread blocked in [`RawSocket::recv`].
    pub fn shutdown(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR) };
        // Unconnected sockets report ENOTCONN but readers are still woken.
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Turns receive-all mode on or off for the interface `iface`.
    ///
    /// Returns `false` if the interface was already in the requested mode.
    ///
    /// The flag is interface-wide. It does not widen what this socket receives: IP input drops
    /// datagrams for other hosts before raw delivery.
    #[cfg(target_os = "linux")]
    pub fn set_promiscuous(&self, iface: &str, enable: bool) -> io::Result<bool> {
        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        if iface.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        for (dst, src) in req.ifr_name.iter_mut().zip(iface.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        let ret = unsafe {
            libc::ioctl(
                self.as_raw_fd(),
                libc::SIOCGIFFLAGS as _,
                &mut req as *mut libc::ifreq,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = unsafe { req.ifr_ifru.ifru_flags };
        let promisc = libc::IFF_PROMISC as libc::c_short;
        let wanted = if enable {
            flags | promisc
        } else {
            flags & !promisc
        };
        if wanted == flags {
            return Ok(false);
        }

        req.ifr_ifru.ifru_flags = wanted;
        let ret = unsafe {
            libc::ioctl(
                self.as_raw_fd(),
                libc::SIOCSIFFLAGS as _,
                &mut req as *mut libc::ifreq,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(true)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_promiscuous(&self, _iface: &str, _enable: bool) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "promiscuous mode is only supported on Linux",
        ))
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
