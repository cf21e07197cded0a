use std::{
    io,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{
    device::Device,
    packet::{is_ipv4_tcp, CapturedPacket},
    socket::RawSocket,
    Error, MAX_DATAGRAM_LEN,
};

/// A channel that delivers whole network-layer datagrams, one per call.
///
/// [`RawSocket`] is the production implementation.
#[cfg_attr(test, automock)]
pub trait DatagramSource {
    /// Blocks until a datagram arrives, copies it into `buf` and returns its length.
    ///
    /// A bounded wait that expires must be reported as `WouldBlock` or `TimedOut`.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Releases the channel and wakes any thread blocked in `recv`.
    fn close(&self) -> io::Result<()>;
}

impl DatagramSource for RawSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        RawSocket::recv(self, buf)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown()
    }
}

/// Switches receive-all mode on the interface behind a bound address.
///
/// [`RawSocket`] is the production implementation.
#[cfg_attr(test, automock)]
pub(crate) trait PromiscControl {
    /// Enables promiscuous mode on the interface that owns `addr`. Returns the interface name if
    /// this call changed its mode.
    fn enable(&self, addr: Ipv4Addr) -> Result<Option<String>, Error>;

    /// Turns promiscuous mode off again on `iface`.
    fn disable(&self, iface: &str) -> io::Result<()>;
}

impl PromiscControl for RawSocket {
    fn enable(&self, addr: Ipv4Addr) -> Result<Option<String>, Error> {
        enable_promisc(self, addr)
    }

    fn disable(&self, iface: &str) -> io::Result<()> {
        self.set_promiscuous(iface, false).map(|_| ())
    }
}

/// Receives every datagram the capture loop accepts.
///
/// The handler runs on the capture thread, so it should return quickly. Returning an error stops
/// the capture; the error is handed back by [`Capture::stop`].
pub trait PacketHandler {
    fn handle_packet(&self, packet: CapturedPacket) -> Result<(), Error>;
}

impl<F> PacketHandler for F
where
    F: Fn(CapturedPacket) -> Result<(), Error>,
{
    fn handle_packet(&self, packet: CapturedPacket) -> Result<(), Error> {
        self(packet)
    }
}

/// Settings applied when a capture is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    bind_addr: Option<Ipv4Addr>,
    promisc: bool,
    timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind_addr: None,
            promisc: true,
            timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Bind to this local address instead of picking one from the host interfaces.
    pub fn bind_addr(mut self, addr: Ipv4Addr) -> Config {
        self.bind_addr = Some(addr);
        self
    }

    /// Try to put the capturing interface in promiscuous mode. The default is true.
    ///
    /// Failing to do so is not fatal; the capture then only sees traffic for this host.
    ///
    /// On Linux this flips `IFF_PROMISC` for the whole host, yet an IPv4 raw socket still only
    /// gets datagrams the IP layer accepts. Frames addressed to other hosts are dropped before
    /// raw delivery, so the socket sees nothing extra. Turn this off to leave the interface
    /// flags alone.
    pub fn promisc(mut self, to: bool) -> Config {
        self.promisc = to;
        self
    }

    /// Set the read timeout in milliseconds. This bounds how long `stop()` waits for the
    /// receive thread. The default is 500.
    pub fn timeout(mut self, ms: u64) -> Config {
        self.timeout = Duration::from_millis(ms.max(1));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a [`Capture`].
pub enum State {
    /// Created, never started
    Idle,
    /// The receive thread is running
    Capturing,
    /// Stopped; the socket has been released
    Stopped,
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl Shared {
    fn fail(&self, err: Error) {
        self.running.store(false, Ordering::SeqCst);
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A live capture of TCP over IPv4.
///
/// `start()` opens a [`RawSocket`] and runs the receive loop on a background thread, passing each
/// TCP datagram to the handler in arrival order. Both `start()` and `stop()` are idempotent, and
/// dropping a running capture stops it.
pub struct Capture<H: PacketHandler + Send + Sync + 'static> {
    config: Config,
    handler: Arc<H>,
    state: State,
    shared: Arc<Shared>,
    source: Option<Arc<dyn DatagramSource + Send + Sync>>,
    worker: Option<JoinHandle<()>>,
    promisc: Option<(Arc<dyn PromiscControl + Send + Sync>, String)>,
}

impl<H: PacketHandler + Send + Sync + 'static> Capture<H> {
    pub fn new(config: Config, handler: Arc<H>) -> Capture<H> {
        Capture {
            config,
            handler,
            state: State::Idle,
            shared: Arc::new(Shared::default()),
            source: None,
            worker: None,
            promisc: None,
        }
    }

    /// The current lifecycle state. A capture whose receive loop was ended by a failing handler
    /// reports [`State::Stopped`]; `stop()` still hands back that failure.
    pub fn state(&self) -> State {
        match self.state {
            State::Capturing if !self.shared.running.load(Ordering::SeqCst) => State::Stopped,
            state => state,
        }
    }

    /// Returns false once the capture is stopped or the receive loop gave up because the handler
    /// failed. In the latter case `stop()` returns the handler's error.
    pub fn is_capturing(&self) -> bool {
        self.state == State::Capturing && self.shared.running.load(Ordering::SeqCst)
    }

    /// Opens the raw socket and starts capturing. Does nothing if already capturing.
    ///
    /// # Errors
    ///
    /// [`Error::CaptureInit`] if the socket cannot be opened or bound, which usually means the
    /// process lacks the privilege to use raw sockets.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.still_running() {
            return Ok(());
        }

        let addr = self
            .config
            .bind_addr
            .unwrap_or_else(Device::lookup_bind_address);
        let socket = Arc::new(open_socket(addr, self.config.timeout)?);
        self.start_bound(socket.clone(), socket, addr)
    }

    /// Starts capturing from `source`, first trying promiscuous mode on the interface behind
    /// `addr` when the config asks for it. A failure there is only logged.
    pub(crate) fn start_bound<S, P>(
        &mut self,
        source: Arc<S>,
        control: Arc<P>,
        addr: Ipv4Addr,
    ) -> Result<(), Error>
    where
        S: DatagramSource + Send + Sync + 'static,
        P: PromiscControl + Send + Sync + 'static,
    {
        if self.still_running() {
            return Ok(());
        }

        if self.config.promisc {
            match control.enable(addr) {
                Ok(Some(iface)) => {
                    info!("promiscuous mode enabled on {}", iface);
                    let control: Arc<dyn PromiscControl + Send + Sync> = control;
                    self.promisc = Some((control, iface));
                }
                Ok(None) => {}
                Err(e) => warn!("{}; capturing packets destined for this host only", e),
            }
        }

        if let Err(e) = self.start_with_source(source) {
            self.restore_promisc();
            return Err(e);
        }
        Ok(())
    }

    /// Starts capturing from an already opened source. Does nothing if already capturing.
    pub fn start_with_source<S>(&mut self, source: Arc<S>) -> Result<(), Error>
    where
        S: DatagramSource + Send + Sync + 'static,
    {
        if self.still_running() {
            return Ok(());
        }

        self.shared.take_failure();
        self.shared.running.store(true, Ordering::SeqCst);

        let source: Arc<dyn DatagramSource + Send + Sync> = source;
        let worker = {
            let source = source.clone();
            let handler = self.handler.clone();
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("rawcap-recv".into())
                .spawn(move || {
                    if let Err(e) = receive_loop(&*source, &shared.running, &*handler) {
                        error!("capture aborted: {}", e);
                        shared.fail(e);
                    }
                    debug!("receive loop exited");
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(Error::CaptureInit(e));
            }
        };

        self.source = Some(source);
        self.worker = Some(worker);
        self.state = State::Capturing;
        info!("capture started");
        Ok(())
    }

    /// Stops capturing and releases the socket. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the handler error that aborted the receive loop, if any.
    pub fn stop(&mut self) -> Result<(), Error> {
        let was_capturing = self.state == State::Capturing;
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(source) = self.source.take() {
            if let Err(e) = source.close() {
                debug!("closing capture source: {}", e);
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("receive thread panicked");
            }
        }
        self.restore_promisc();
        self.state = State::Stopped;

        if was_capturing {
            info!("capture stopped");
        }
        match self.shared.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns true while the receive loop is alive. A loop the handler ended is reaped here so
    /// the capture can be started again.
    fn still_running(&mut self) -> bool {
        if self.state != State::Capturing {
            return false;
        }
        if self.shared.running.load(Ordering::SeqCst) {
            return true;
        }
        if let Err(e) = self.stop() {
            warn!("previous capture ended with an error: {}", e);
        }
        false
    }

    fn restore_promisc(&mut self) {
        if let Some((control, iface)) = self.promisc.take() {
            match control.disable(&iface) {
                Ok(()) => debug!("promiscuous mode disabled on {}", iface),
                Err(e) => warn!("could not disable promiscuous mode on {}: {}", iface, e),
            }
        }
    }
}

impl<H: PacketHandler + Send + Sync + 'static> Drop for Capture<H> {
    fn drop(&mut self) {
        if self.state == State::Capturing {
            if let Err(e) = self.stop() {
                error!("{}", e);
            }
        }
    }
}

fn open_socket(addr: Ipv4Addr, timeout: Duration) -> Result<RawSocket, Error> {
    let socket = RawSocket::open().map_err(Error::CaptureInit)?;
    socket.bind(addr).map_err(Error::CaptureInit)?;
    socket
        .set_read_timeout(timeout)
        .map_err(Error::CaptureInit)?;
    debug!("raw socket bound to {}", addr);
    Ok(socket)
}

/// Puts the interface behind `addr` in promiscuous mode. Returns the interface name if this call
/// changed its mode.
fn enable_promisc(socket: &RawSocket, addr: Ipv4Addr) -> Result<Option<String>, Error> {
    let devices = Device::list().map_err(|e| {
        Error::PromiscuousModeUnavailable(io::Error::new(io::ErrorKind::Other, e.to_string()))
    })?;
    let device = devices
        .into_iter()
        .find(|dev| {
            if addr.is_unspecified() {
                dev.is_up() && !dev.is_loopback()
            } else {
                dev.addresses.contains(&addr)
            }
        })
        .ok_or_else(|| {
            Error::PromiscuousModeUnavailable(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no interface found for {addr}"),
            ))
        })?;

    let changed = socket
        .set_promiscuous(&device.name, true)
        .map_err(Error::PromiscuousModeUnavailable)?;
    Ok(changed.then_some(device.name))
}

/// Reads datagrams from `source` until `running` is cleared, forwarding TCP ones to `handler`.
///
/// Receive errors are logged and skipped while `running` is set; once it is cleared they mean
/// the source was closed on purpose and the loop ends. A handler error ends the loop and is
/// returned.
pub(crate) fn receive_loop<S, H>(source: &S, running: &AtomicBool, handler: &H) -> Result<(), Error>
where
    S: DatagramSource + ?Sized,
    H: PacketHandler + ?Sized,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    while running.load(Ordering::SeqCst) {
        match source.recv(&mut buf) {
            Ok(n) => {
                let datagram = &buf[..n];
                if is_ipv4_tcp(datagram) {
                    handler.handle_packet(CapturedPacket::now(datagram))?;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                warn!("{}", Error::Receive(e));
            }
        }
    }

    Ok(())
}
