//! Sockets to and from the device.
//!
//! Commands go out either as one-shot UDP datagrams or over a single persistent TCP
//! connection. Records come back on background receive loops, one thread each, that read
//! with a short timeout so they can notice their stop flag. Loops are always stopped by
//! setting the flag and joining, never by closing the socket under them.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::demux::{Reassembler, RecordSink};
use crate::error::{Error, Result};

/// Largest datagram the device sends
pub const RECEIVE_BUFFER_SIZE: usize = 65535;

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// A running receive loop and its stop flag
pub struct ReceiveLoop {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ReceiveLoop {
    fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<()> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(flag))?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Set the stop flag and wait for the loop to notice it
    pub fn stop(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::LoopPanicked(self.name))?,
            None => Ok(()),
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!("{} loop ended with error: {}", self.name, e);
        }
    }
}

/// Send one datagram from a fresh socket and return the local port it went out on.
///
/// The device pushes subscribed records back to that port, so the caller binds a
/// receiver to it once this socket is gone.
pub fn send_datagram(bind: SocketAddr, device: SocketAddr, message: &[u8]) -> Result<u16> {
    let socket = UdpSocket::bind(bind)?;
    let sent = socket.send_to(message, device)?;
    if sent != message.len() {
        warn!(sent, len = message.len(), "datagram truncated");
    }
    let port = socket.local_addr()?.port();
    debug!(port, len = message.len(), %device, "datagram sent");
    Ok(port)
}

/// Bind `bind` and hand every datagram received on it to `sink` on a new thread
pub fn spawn_udp_receiver<S>(bind: SocketAddr, poll: Duration, sink: S) -> Result<ReceiveLoop>
where
    S: RecordSink + 'static,
{
    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(poll))?;
    info!(port = bind.port(), "catching data");
    ReceiveLoop::spawn("udp-rx", move |stop| udp_loop(socket, stop, sink))
}

fn udp_loop<S: RecordSink>(socket: UdpSocket, stop: Arc<AtomicBool>, mut sink: S) -> Result<()> {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => {
                if let Err(e) = sink.consume(&buf[..n]) {
                    break Err(e);
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => break Err(e.into()),
        }
    };
    let finished = sink.finish();
    debug!("udp receive loop exiting");
    result.and(finished)
}

fn tcp_loop<S: RecordSink>(
    mut stream: TcpStream,
    stop: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    mut sink: S,
) -> Result<()> {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                warn!("device closed the TCP connection");
                break Err(Error::ConnectionClosed);
            }
            Ok(n) => {
                if let Err(e) = sink.consume(&buf[..n]) {
                    break Err(e);
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e.into()),
        }
    };
    // The socket is gone, not just this reader
    if matches!(result, Err(Error::ConnectionClosed) | Err(Error::Io(_))) {
        lost.store(true, Ordering::Relaxed);
    }
    let finished = sink.finish();
    debug!("tcp receive loop exiting");
    result.and(finished)
}

#[derive(Default)]
struct TcpState {
    stream: Option<TcpStream>,
    receiver: Option<ReceiveLoop>,
    /// Set by the reader when the device hangs up or the socket fails
    lost: Arc<AtomicBool>,
}

impl TcpState {
    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Relaxed)
    }

    /// The open stream, or `ConnectionClosed` once the reader has seen it die.
    /// A lost session stays lost until [`TcpChannel::connect`] opens a new one.
    fn live_stream(&mut self) -> Result<&mut TcpStream> {
        if self.is_lost() {
            if self.stream.is_some() {
                warn!("TCP session lost, reconnect to continue");
                if let Err(e) = self.teardown() {
                    debug!("TCP reader ended with: {}", e);
                }
            }
            return Err(Error::ConnectionClosed);
        }
        self.stream()
    }

    /// Stop the receiver, then shut the socket down
    fn teardown(&mut self) -> Result<()> {
        let stopped = match self.receiver.take() {
            Some(receiver) => receiver.stop(),
            None => Ok(()),
        };
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!("TCP shutdown failed: {}", e);
                }
            }
        }
        stopped
    }
}

/// The one TCP connection to the device, shared by everything that sends commands
#[derive(Clone, Default)]
pub struct TcpChannel {
    state: Arc<Mutex<TcpState>>,
}

impl TcpChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TcpState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect unless a live connection is already open. Replaces a lost one.
    pub fn connect(&self, device: SocketAddr, timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        if state.stream.is_some() && !state.is_lost() {
            return Ok(());
        }
        if let Err(e) = state.teardown() {
            debug!("previous TCP session ended with: {}", e);
        }
        let stream = TcpStream::connect_timeout(&device, timeout)?;
        stream.set_nodelay(true)?;
        info!(%device, local = ?stream.local_addr().ok(), "contacting device via TCP");
        state.stream = Some(stream);
        state.lost = Arc::default();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        state.stream.is_some() && !state.is_lost()
    }

    /// Our end of the connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.lock().stream()?.local_addr()?)
    }

    /// Write one message. A failed write ends the session.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let written = state.live_stream()?.write_all(message);
        if let Err(e) = written {
            warn!("TCP send failed, dropping connection: {}", e);
            // The write error is what the caller needs to see
            let _ = state.teardown();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn receiver_running(&self) -> bool {
        self.lock().receiver.as_ref().map_or(false, |r| r.is_running())
    }

    /// Start reading the connection into `sink`, unless a reader is already running
    pub fn ensure_receiver<S>(&self, poll: Duration, sink: S) -> Result<()>
    where
        S: RecordSink + 'static,
    {
        let mut state = self.lock();
        if state.is_lost() {
            return state.live_stream().map(|_| ());
        }
        if state.receiver.as_ref().map_or(false, |r| r.is_running()) {
            return Ok(());
        }
        // Collect whatever ended the previous reader before replacing it
        if let Some(old) = state.receiver.take() {
            if let Err(e) = old.stop() {
                debug!("previous TCP reader ended with: {}", e);
            }
        }
        let reader = state.stream()?.try_clone()?;
        reader.set_read_timeout(Some(poll))?;
        let sink = Reassembler::new(sink);
        let lost = state.lost.clone();
        state.receiver = Some(ReceiveLoop::spawn("tcp-rx", move |stop| {
            tcp_loop(reader, stop, lost, sink)
        })?);
        Ok(())
    }

    /// Stop the receive loop, then shut down and release the connection
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.stream.is_some() {
            info!("closing TCP connection");
        }
        let closed = state.teardown();
        state.lost = Arc::default();
        closed
    }
}
