use std::{fmt, ops::Deref};

use chrono::{DateTime, TimeZone, Utc};

use crate::Error;

/// Smallest possible IPv4 header, in bytes.
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// Offset of the protocol field within the IPv4 header.
pub const IPV4_PROTOCOL_OFFSET: usize = 9;
/// IANA protocol number of TCP.
pub const IPPROTO_TCP: u8 = 6;

/// Returns true if `datagram` is long enough to hold an IPv4 header and its protocol field says
/// TCP.
pub fn is_ipv4_tcp(datagram: &[u8]) -> bool {
    datagram.len() >= IPV4_MIN_HEADER_LEN && datagram[IPV4_PROTOCOL_OFFSET] == IPPROTO_TCP
}

/// A datagram accepted by the capture loop together with the wall-clock time it was received.
///
/// The payload is a private copy of the receive buffer and includes the IPv4 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    data: Box<[u8]>,
    timestamp: DateTime<Utc>,
}

impl CapturedPacket {
    /// Copies `data` into a new packet stamped with `timestamp`.
    pub fn new(data: &[u8], timestamp: DateTime<Utc>) -> CapturedPacket {
        CapturedPacket {
            data: data.into(),
            timestamp,
        }
    }

    /// Copies `data` into a new packet stamped with the current time.
    pub fn now(data: &[u8]) -> CapturedPacket {
        CapturedPacket::new(data, Utc::now())
    }

    /// The captured bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The time the packet was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Deref for CapturedPacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// The 16-byte record header that precedes every packet in a savefile.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Seconds since the Unix epoch, UTC
    pub ts_sec: u32,
    /// Microseconds within the second, 0 to 999999
    pub ts_usec: u32,
    /// The number of bytes of the packet stored in the file
    pub caplen: u32,
    /// The length of the packet on the wire
    pub len: u32,
}

impl PacketHeader {
    /// Encoded size of a record header.
    pub const LEN: usize = 16;

    /// Builds the record header for `packet`.
    ///
    /// Sub-microsecond precision is truncated. Both length fields are the payload length since
    /// rawcap never stores a partial datagram.
    pub fn for_packet(packet: &CapturedPacket) -> Result<PacketHeader, Error> {
        let (ts_sec, ts_usec) = split_timestamp(packet.timestamp)?;
        let len = u32::try_from(packet.len()).map_err(|_| Error::PayloadTooLarge(packet.len()))?;
        Ok(PacketHeader {
            ts_sec,
            ts_usec,
            caplen: len,
            len,
        })
    }

    /// The time encoded in this header, or `None` if `ts_usec` is not a valid microsecond count.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        if self.ts_usec > 999_999 {
            return None;
        }
        Utc.timestamp_opt(self.ts_sec as i64, self.ts_usec * 1000)
            .single()
    }

    /// Little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; PacketHeader::LEN] {
        let mut buf = [0u8; PacketHeader::LEN];
        buf[0..4].copy_from_slice(&self.ts_sec.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ts_usec.to_le_bytes());
        buf[8..12].copy_from_slice(&self.caplen.to_le_bytes());
        buf[12..16].copy_from_slice(&self.len.to_le_bytes());
        buf
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PacketHeader {{ ts: {}.{:06}, caplen: {}, len: {} }}",
            self.ts_sec, self.ts_usec, self.caplen, self.len
        )
    }
}

fn split_timestamp(ts: DateTime<Utc>) -> Result<(u32, u32), Error> {
    let secs = u32::try_from(ts.timestamp()).map_err(|_| Error::TimestampOutOfRange)?;
    // chrono reports a leap second as nanos >= 1_000_000_000.
    let usecs = ts.timestamp_subsec_micros().min(999_999);
    Ok((secs, usecs))
}
