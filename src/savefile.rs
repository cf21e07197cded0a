use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use chrono::{DateTime, Utc};
use log::{debug, trace};

use crate::{
    linktype::Linktype,
    packet::{CapturedPacket, PacketHeader},
    Error, MAX_DATAGRAM_LEN,
};

/// Magic number of a microsecond-resolution savefile.
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;

/// The 24-byte global header at the start of every savefile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// GMT to local correction, always 0
    pub thiszone: i32,
    /// Timestamp accuracy, always 0
    pub sigfigs: u32,
    /// Largest payload a record may hold
    pub snaplen: u32,
    pub linktype: Linktype,
}

impl FileHeader {
    /// Encoded size of the file header.
    pub const LEN: usize = 24;

    /// Header for raw IPv4 records with the given snapshot length.
    pub fn new(snaplen: u32) -> FileHeader {
        FileHeader {
            magic: PCAP_MAGIC,
            version_major: PCAP_VERSION_MAJOR,
            version_minor: PCAP_VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            linktype: Linktype::RAW,
        }
    }

    /// Little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; FileHeader::LEN] {
        let mut buf = [0u8; FileHeader::LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        buf[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        buf[8..12].copy_from_slice(&self.thiszone.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sigfigs.to_le_bytes());
        buf[16..20].copy_from_slice(&self.snaplen.to_le_bytes());
        buf[20..24].copy_from_slice(&(self.linktype.0 as u32).to_le_bytes());
        buf
    }
}

impl Default for FileHeader {
    fn default() -> FileHeader {
        FileHeader::new(MAX_DATAGRAM_LEN as u32)
    }
}

/// Abstraction for writing pcap savefiles.
///
/// The file header is written when the `Savefile` is constructed and never again. Each packet is
/// written as a [`PacketHeader`] immediately followed by its bytes, in the order the packets are
/// handed in.
///
/// A `Savefile` takes ownership of its sink. To keep ownership of a sink, pass a mutable
/// reference instead: dropping the `Savefile` then flushes the sink but leaves it open.
pub struct Savefile<W: Write> {
    writer: W,
    header: FileHeader,
    header_written: bool,
    packets: u64,
}

impl Savefile<BufWriter<File>> {
    /// Creates (or truncates) the file at `path` and writes the file header to it.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::create(path.as_ref())?;
        debug!("created savefile {}", path.as_ref().display());
        Savefile::new(BufWriter::new(file))
    }
}

impl<W: Write> Savefile<W> {
    /// Binds a savefile to `writer` with the default raw IPv4 header.
    pub fn new(writer: W) -> Result<Self, Error> {
        Savefile::with_header(writer, FileHeader::default())
    }

    /// Binds a savefile to `writer` and writes `header`.
    pub fn with_header(writer: W, header: FileHeader) -> Result<Self, Error> {
        let mut savefile = Savefile {
            writer,
            header,
            header_written: false,
            packets: 0,
        };
        savefile.write_header()?;
        Ok(savefile)
    }

    fn write_header(&mut self) -> Result<(), Error> {
        if self.header_written {
            return Ok(());
        }
        self.writer.write_all(&self.header.to_bytes())?;
        self.header_written = true;
        Ok(())
    }

    /// Write a packet to the savefile.
    ///
    /// Returns the number of bytes written. An empty packet is skipped and writes nothing.
    pub fn write_packet(&mut self, packet: &CapturedPacket) -> Result<usize, Error> {
        if packet.is_empty() {
            return Ok(0);
        }
        if packet.len() > self.header.snaplen as usize {
            return Err(Error::PayloadTooLarge(packet.len()));
        }
        let header = PacketHeader::for_packet(packet)?;

        self.write_header()?;
        self.writer.write_all(&header.to_bytes())?;
        self.writer.write_all(packet.data())?;
        self.packets += 1;
        trace!("recorded {:?}", header);

        Ok(PacketHeader::LEN + packet.len())
    }

    /// Writes `data` stamped with `timestamp`. See [`Savefile::write_packet`].
    pub fn write(&mut self, data: &[u8], timestamp: DateTime<Utc>) -> Result<usize, Error> {
        self.write_packet(&CapturedPacket::new(data, timestamp))
    }

    /// Flushes all the packets that haven't been written to the sink
    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and releases the sink.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush()
    }

    /// The header written at the start of the file
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Number of packet records written so far
    pub fn packets_written(&self) -> u64 {
        self.packets
    }
}

impl<W: Write> Drop for Savefile<W> {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            debug!("flush on drop failed: {}", e);
        }
    }
}
