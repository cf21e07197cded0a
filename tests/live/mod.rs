/***
* These tests open a real raw socket, so they need root (or CAP_NET_RAW) and only run on Linux.
*
* To build and run them, run:
*

 cargo test --no-run --test lib |& \
           sed -e 's/[()]//g' | \
           awk '/Executable/ {print $3" --include-ignored live"}' | \
           xargs sudo

*/
#[cfg(target_os = "linux")]
mod tests {
    use std::{
        io::{Read, Write},
        net::{Ipv4Addr, TcpListener, TcpStream},
        sync::Arc,
        thread,
        time::Duration,
    };

    use tempfile::TempDir;

    use rawcap::{Capture, CaptureSession, CapturedPacket, Config, Error};

    use crate::read_savefile;

    #[test]
    #[ignore]
    fn live_loopback_tcp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.pcap");

        let session = Arc::new(CaptureSession::create(&path).unwrap());
        let config = Config::new()
            .bind_addr(Ipv4Addr::LOCALHOST)
            .promisc(false)
            .timeout(100);
        let mut cap = Capture::new(config, session.clone());
        cap.start().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
        });
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        server.join().unwrap();

        thread::sleep(Duration::from_millis(200));
        cap.stop().unwrap();
        let total = session.finish().unwrap();
        drop(cap);
        drop(session);

        let (_, records) = read_savefile(&path);
        assert!(total > 0);
        assert_eq!(records.len() as u64, total);
        for record in records {
            assert_eq!(record.header.caplen, record.header.len);
            assert_eq!(record.data[9], 6);
        }
    }

    #[test]
    #[ignore]
    fn live_start_stop_twice() {
        let handler = Arc::new(|_: CapturedPacket| -> Result<(), Error> { Ok(()) });
        let mut cap = Capture::new(Config::new().promisc(false), handler);
        cap.start().unwrap();
        cap.start().unwrap();
        cap.stop().unwrap();
        cap.stop().unwrap();
    }
}
