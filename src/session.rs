use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::debug;

use crate::{capture::PacketHandler, packet::CapturedPacket, savefile::Savefile, Error};

/// A [`Savefile`] and the running packet count, shared between the capture thread and the thread
/// that controls the capture.
///
/// The count is the savefile's own record counter, read under the same lock that guards each
/// write, so a reader never sees a count that disagrees with the file contents.
pub struct CaptureSession<W: Write> {
    savefile: Mutex<Savefile<W>>,
}

impl CaptureSession<BufWriter<File>> {
    /// Creates the savefile at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(CaptureSession::new(Savefile::create(path)?))
    }
}

impl<W: Write> CaptureSession<W> {
    pub fn new(savefile: Savefile<W>) -> CaptureSession<W> {
        CaptureSession {
            savefile: Mutex::new(savefile),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Savefile<W>> {
        self.savefile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one packet. Empty packets are ignored and not counted.
    pub fn record(&self, packet: &CapturedPacket) -> Result<(), Error> {
        self.lock().write_packet(packet)?;
        Ok(())
    }

    /// Number of packets recorded so far
    pub fn packet_count(&self) -> u64 {
        self.lock().packets_written()
    }

    /// Pushes buffered records to the sink.
    pub fn flush(&self) -> Result<(), Error> {
        self.lock().flush()
    }

    /// Flushes the savefile and returns the final packet count.
    ///
    /// The sink itself is released when the last reference to the session is dropped.
    pub fn finish(&self) -> Result<u64, Error> {
        let mut savefile = self.lock();
        savefile.flush()?;
        let packets = savefile.packets_written();
        debug!("session finished after {} packets", packets);
        Ok(packets)
    }
}

impl<W: Write> PacketHandler for CaptureSession<W> {
    fn handle_packet(&self, packet: CapturedPacket) -> Result<(), Error> {
        self.record(&packet)
    }
}
