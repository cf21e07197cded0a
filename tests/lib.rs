use std::{
    collections::VecDeque,
    fs, io,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{TimeZone, Utc};
use etherparse::PacketBuilder;
use tempfile::TempDir;

use rawcap::{
    Capture, CaptureSession, CapturedPacket, Config, DatagramSource, FileHeader, PacketHeader,
    Savefile, State,
};

mod live;

/// One record read back from a savefile.
#[derive(Debug, PartialEq, Eq)]
pub struct Record {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

/// Splits a savefile into its header bytes and records.
pub fn read_savefile(path: &Path) -> ([u8; 24], Vec<Record>) {
    let bytes = fs::read(path).unwrap();
    assert!(bytes.len() >= FileHeader::LEN);

    let mut header = [0u8; 24];
    header.copy_from_slice(&bytes[..24]);

    let u32_at = |b: &[u8], i: usize| u32::from_le_bytes(b[i..i + 4].try_into().unwrap());
    let mut records = vec![];
    let mut rest = &bytes[24..];
    while !rest.is_empty() {
        let header = PacketHeader {
            ts_sec: u32_at(rest, 0),
            ts_usec: u32_at(rest, 4),
            caplen: u32_at(rest, 8),
            len: u32_at(rest, 12),
        };
        let end = PacketHeader::LEN + header.caplen as usize;
        records.push(Record {
            header,
            data: rest[PacketHeader::LEN..end].to_vec(),
        });
        rest = &rest[end..];
    }
    (header, records)
}

pub fn tcp_packet(src_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv4([192, 168, 1, 10], [192, 168, 1, 20], 64)
        .tcp(src_port, 443, 1000, 64240)
        .ack(1);
    let mut pkt = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut pkt, payload).unwrap();
    pkt
}

fn icmp_packet() -> Vec<u8> {
    let builder = PacketBuilder::ipv4([192, 168, 1, 10], [192, 168, 1, 20], 64)
        .icmpv4_echo_request(1, 1);
    let mut pkt = Vec::with_capacity(builder.size(8));
    builder.write(&mut pkt, &[0; 8]).unwrap();
    pkt
}

/// Hands out queued datagrams, then idles until closed.
struct Replay {
    queue: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
}

impl Replay {
    fn new(datagrams: Vec<Vec<u8>>) -> Replay {
        Replay {
            queue: Mutex::new(datagrams.into()),
            closed: AtomicBool::new(false),
        }
    }

    fn drained(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl DatagramSource for Replay {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        match self.queue.lock().unwrap().pop_front() {
            Some(d) => {
                buf[..d.len()].copy_from_slice(&d);
                Ok(d.len())
            }
            None => {
                thread::sleep(Duration::from_millis(2));
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn savefile_to_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.pcap");

    let first = tcp_packet(1000, &[]);
    let second = tcp_packet(1001, b"hello");
    {
        let mut save = Savefile::create(&path).unwrap();
        save.write(&first, Utc.timestamp_opt(1460408319, 1_234_000).unwrap())
            .unwrap();
        save.write(&second, Utc.timestamp_opt(1460408320, 4_321_999).unwrap())
            .unwrap();
        save.close().unwrap();
    }

    let (header, records) = read_savefile(&path);
    assert_eq!(header, FileHeader::default().to_bytes());
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].header.ts_sec, 1460408319);
    assert_eq!(records[0].header.ts_usec, 1234);
    assert_eq!(records[0].header.caplen, 40);
    assert_eq!(records[0].header.len, 40);
    assert_eq!(records[0].data, first);

    assert_eq!(records[1].header.ts_sec, 1460408320);
    assert_eq!(records[1].header.ts_usec, 4321);
    assert_eq!(records[1].header.caplen, second.len() as u32);
    assert_eq!(records[1].data, second);
}

#[test]
fn savefile_empty_capture_has_only_header() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.pcap");

    drop(Savefile::create(&path).unwrap());

    let (_, records) = read_savefile(&path);
    assert!(records.is_empty());
    assert_eq!(fs::metadata(&path).unwrap().len(), 24);
}

#[test]
fn savefile_create_in_missing_dir_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("no/such/dir/out.pcap");
    assert!(matches!(
        Savefile::create(path),
        Err(rawcap::Error::Io(_))
    ));
}

#[test]
fn capture_into_session_keeps_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.pcap");

    let tcp: Vec<Vec<u8>> = (0..5).map(|i| tcp_packet(2000 + i, &[i as u8; 3])).collect();
    let mut datagrams = vec![];
    for pkt in &tcp {
        datagrams.push(pkt.clone());
        datagrams.push(icmp_packet());
    }
    let source = Arc::new(Replay::new(datagrams));

    let session = Arc::new(CaptureSession::create(&path).unwrap());
    let mut cap = Capture::new(Config::new(), session.clone());
    cap.start_with_source(source.clone()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !source.drained() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    cap.stop().unwrap();
    assert_eq!(cap.state(), State::Stopped);
    assert_eq!(session.finish().unwrap(), 5);
    drop(cap);
    drop(session);

    let (_, records) = read_savefile(&path);
    let data: Vec<Vec<u8>> = records.into_iter().map(|r| r.data).collect();
    assert_eq!(data, tcp);
}

#[test]
fn captured_packet_timestamps_are_recent() {
    let before = Utc::now();
    let packet = CapturedPacket::now(&tcp_packet(1, &[]));
    let header = PacketHeader::for_packet(&packet).unwrap();
    let after = Utc::now();

    let ts = header.timestamp().unwrap();
    assert!(ts <= after);
    assert!(before.timestamp() <= ts.timestamp());
}
