//! rawcap captures TCP over IPv4 from a raw socket and records it in the classic libpcap
//! savefile format, using `LINKTYPE_RAW` so that every record holds a bare IPv4 datagram.
//!
//! The crate has two halves that meet at the [`PacketHandler`] trait:
//!
//! * [`Capture`] owns a [`RawSocket`], runs a blocking receive loop on a background thread and
//!   hands every TCP datagram to a handler as a [`CapturedPacket`].
//! * [`Savefile`] serializes packets into any [`std::io::Write`] sink.
//!
//! [`CaptureSession`] ties the two together: it wraps a `Savefile` and a packet counter behind a
//! single mutex and is what the `rawcap` binary registers with the engine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rawcap::{Capture, CaptureSession, Config};
//!
//! let session = Arc::new(CaptureSession::create("capture.pcap").unwrap());
//! let mut cap = Capture::new(Config::new().promisc(true), session.clone());
//! cap.start().unwrap();
//! // ...
//! cap.stop().unwrap();
//! println!("{} packets", session.finish().unwrap());
//! ```

use std::{fmt, io};

#[cfg(not(unix))]
compile_error!("rawcap needs a Unix raw socket implementation");

mod capture;
mod device;
mod linktype;
mod packet;
mod savefile;
mod session;
mod socket;

pub use capture::{Capture, Config, DatagramSource, PacketHandler, State};
pub use device::{select_bind_address, Device, IfFlags};
pub use linktype::Linktype;
pub use packet::{is_ipv4_tcp, CapturedPacket, PacketHeader};
pub use savefile::{FileHeader, Savefile};
pub use session::CaptureSession;
pub use socket::RawSocket;

/// Size of the receive buffer, the largest possible IPv4 datagram.
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// An error produced while capturing or recording packets.
#[derive(Debug)]
pub enum Error {
    /// The raw socket could not be opened or bound
    CaptureInit(io::Error),
    /// Receive-all mode could not be enabled on the socket
    PromiscuousModeUnavailable(io::Error),
    /// A receive call on a live socket failed
    Receive(io::Error),
    /// Writing to or flushing the savefile sink failed
    Io(io::Error),
    /// The packet timestamp does not fit the 32-bit unsigned seconds field
    TimestampOutOfRange,
    /// The payload is longer than the savefile snapshot length
    PayloadTooLarge(usize),
    /// A libc call failed with the given errno
    ErrnoError(errno::Errno),
}

impl Error {
    /// Returns true when the underlying OS error is a permission failure.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::CaptureInit(e)
            | Error::PromiscuousModeUnavailable(e)
            | Error::Receive(e)
            | Error::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            Error::ErrnoError(e) => e.0 == libc::EPERM || e.0 == libc::EACCES,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CaptureInit(e) => write!(
                f,
                "failed to start packet capture: {e}\n\n\
                 Possible causes:\n\
                 1. Not running with root privileges (or without CAP_NET_RAW)\n\
                 2. Raw sockets are restricted on this platform\n\
                 3. The network adapter does not support raw socket capture"
            ),
            Error::PromiscuousModeUnavailable(e) => {
                write!(f, "could not enable promiscuous mode: {e}")
            }
            Error::Receive(e) => write!(f, "error receiving packet: {e}"),
            Error::Io(e) => write!(f, "savefile write failed: {e}"),
            Error::TimestampOutOfRange => {
                write!(f, "packet timestamp cannot be represented in a pcap record")
            }
            Error::PayloadTooLarge(len) => write!(
                f,
                "packet of {len} bytes exceeds the snapshot length of the savefile"
            ),
            Error::ErrnoError(e) => write!(f, "libc error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::CaptureInit(e)
            | Error::PromiscuousModeUnavailable(e)
            | Error::Receive(e)
            | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(obj: io::Error) -> Error {
        Error::Io(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_init_display_has_remediation() {
        let err = Error::CaptureInit(io::Error::from(io::ErrorKind::PermissionDenied));
        let msg = err.to_string();
        assert!(msg.contains("root privileges"));
        assert!(msg.contains("Raw sockets are restricted"));
        assert!(msg.contains("network adapter"));
    }

    #[test]
    fn test_is_permission_denied() {
        let err = Error::CaptureInit(io::Error::from_raw_os_error(libc::EPERM));
        assert!(err.is_permission_denied());

        let err = Error::ErrnoError(errno::Errno(libc::EACCES));
        assert!(err.is_permission_denied());

        assert!(!Error::TimestampOutOfRange.is_permission_denied());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::from(io::ErrorKind::WriteZero).into();
        assert!(matches!(err, Error::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
