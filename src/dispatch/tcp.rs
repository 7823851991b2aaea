// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A [`Transport`] over TCP, one JSON message per line.

use std::{
    collections::{HashMap, VecDeque},
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{DispatchError, Event, EventSender, PortId, Transport};
use crate::protocol::Message;

/// How long the listener sleeps when nobody is waiting to connect.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Incoming lines longer than this drop the connection.
pub(super) const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Outgoing lines queued per connection before it counts as stalled.
const OUTBOX_CAPACITY: usize = 64;

/// A writer blocked for this long gives up on its connection.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected port. Lines are written by the connection's own writer
/// thread, so nothing on the event thread blocks on a slow peer.
struct Connection {
    /// Kept for shutting the connection down.
    stream: TcpStream,
    outbox: Sender<String>,
}

type Streams = Arc<Mutex<HashMap<PortId, Connection>>>;

pub struct TcpTransport {
    listen_addr: SocketAddr,
    driver_addr: SocketAddr,
    connect_timeout: Duration,

    /// Every connected port.
    streams: Streams,

    /// Connections waiting to be accepted.
    pending: Arc<Mutex<VecDeque<TcpStream>>>,

    /// Set while the listener thread should keep going.
    listening: Option<Arc<AtomicBool>>,

    /// The address actually bound, once listening.
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,

    next_client: u32,
}

impl TcpTransport {
    pub fn new(
        listen_addr: SocketAddr,
        driver_addr: SocketAddr,
        connect_timeout: Duration,
    ) -> TcpTransport {
        TcpTransport {
            listen_addr,
            driver_addr,
            connect_timeout,
            streams: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            listening: None,
            bound_addr: Arc::new(Mutex::new(None)),
            next_client: 0,
        }
    }

    /// The address the acceptor is listening on. Useful when listening on
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    fn listen(&mut self, events: &EventSender) {
        if self.listening.is_some() {
            return;
        }
        let listener = match TcpListener::bind(self.listen_addr)
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
        {
            Ok(l) => l,
            Err(e) => {
                warn!("Couldn't listen on {}: {e}", self.listen_addr);
                events.post(PortId::Acceptor, Event::Disconnected);
                return;
            }
        };
        *self.bound_addr.lock() = listener.local_addr().ok();
        debug!("Listening on {:?}", self.local_addr());

        let running = Arc::new(AtomicBool::new(true));
        self.listening = Some(Arc::clone(&running));
        events.post(PortId::Acceptor, Event::Connected);
        let pending = Arc::clone(&self.pending);
        let events = events.clone();
        thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            debug!("Connection from {addr}");
                            if let Err(e) = stream.set_nonblocking(false) {
                                warn!("Couldn't configure the connection from {addr}: {e}");
                                continue;
                            }
                            pending.lock().push_back(stream);
                            if !events.post(PortId::Acceptor, Event::AcceptRequest) {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                        Err(e) => warn!("Accept error: {e}"),
                    }
                }
                trace!("Acceptor thread finished");
            })
            .expect("OS can create threads");
    }

    fn connect_driver(&mut self, events: &EventSender) {
        let addr = self.driver_addr;
        let timeout = self.connect_timeout;
        let streams = Arc::clone(&self.streams);
        let events = events.clone();
        thread::Builder::new()
            .name("driver-connect".to_string())
            .spawn(move || match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    debug!("Connected to the driver at {addr}");
                    attach(PortId::Driver, stream, &streams, &events);
                }
                Err(e) => {
                    debug!("Couldn't connect to the driver at {addr}: {e}");
                    events.post(PortId::Driver, Event::Disconnected);
                }
            })
            .expect("OS can create threads");
    }
}

/// Register a connected stream and start its reader and writer threads. The
/// port gets [`Event::Connected`] straight away and [`Event::Disconnected`]
/// when the remote end goes, unless the port was closed locally first.
fn attach(port: PortId, stream: TcpStream, streams: &Streams, events: &EventSender) {
    let (reader, writer) = match stream
        .try_clone()
        .and_then(|r| stream.try_clone().map(|w| (r, w)))
        .and_then(|(r, w)| w.set_write_timeout(Some(WRITE_TIMEOUT)).map(|_| (r, w)))
    {
        Ok(halves) => halves,
        Err(e) => {
            warn!("Couldn't set up {port}: {e}");
            events.post(port, Event::Disconnected);
            return;
        }
    };

    let (outbox, lines) = crossbeam_channel::bounded::<String>(OUTBOX_CAPACITY);
    thread::Builder::new()
        .name(format!("writer-{port}"))
        .spawn(move || {
            let mut writer = writer;
            for line in lines.iter() {
                if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.flush()) {
                    trace!("Write error on {port}: {e}");
                    break;
                }
            }
            // Either the port was closed and the queue drained, or the peer
            // is gone. The reader notices and reports it.
            let _ = writer.shutdown(Shutdown::Both);
            trace!("Writer for {port} finished");
        })
        .expect("OS can create threads");

    streams.lock().insert(port, Connection { stream, outbox });
    events.post(port, Event::Connected);

    let streams = Arc::clone(streams);
    let events = events.clone();
    thread::Builder::new()
        .name(format!("reader-{port}"))
        .spawn(move || {
            read_messages(port, BufReader::new(reader), &events);
            // Only report the loss if nobody closed the port on purpose.
            if let Some(conn) = streams.lock().remove(&port) {
                let _ = conn.stream.shutdown(Shutdown::Both);
                events.post(port, Event::Disconnected);
            }
        })
        .expect("OS can create threads");
}

/// Post every message read from `reader` until it ends, fails or sends a
/// line longer than [`MAX_LINE_LENGTH`].
fn read_messages<R: BufRead>(port: PortId, mut reader: R, events: &EventSender) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let limit = MAX_LINE_LENGTH as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => (),
            Err(e) => {
                trace!("Read error on {port}: {e}");
                return;
            }
        }
        if buf.len() > MAX_LINE_LENGTH && buf.last() != Some(&b'\n') {
            warn!("{port} sent a line longer than {MAX_LINE_LENGTH} bytes; dropping it");
            return;
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(l) => l,
            Err(e) => {
                warn!("Ignoring a malformed message from {port}: {e}");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Message::from_line(line) {
            Ok(message) => {
                if !events.post(port, Event::Message(message)) {
                    return;
                }
            }
            Err(e) => warn!("Ignoring a malformed message from {port}: {e}"),
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, port: PortId, events: &EventSender) {
        match port {
            PortId::Acceptor => self.listen(events),
            PortId::Driver => self.connect_driver(events),
            PortId::Local | PortId::Client(_) => {
                trace!("{port} can't be opened; ignoring");
            }
        }
    }

    fn close(&mut self, port: PortId) {
        if port == PortId::Acceptor {
            if let Some(running) = self.listening.take() {
                running.store(false, Ordering::SeqCst);
            }
            return;
        }
        // Dropping the outbox lets the writer drain what's queued and then
        // shut the connection.
        if let Some(conn) = self.streams.lock().remove(&port) {
            let _ = conn.stream.shutdown(Shutdown::Read);
        }
    }

    fn send(&mut self, port: PortId, message: &Message) -> Result<(), DispatchError> {
        let mut line = message.to_line()?;
        line.push('\n');
        let streams = self.streams.lock();
        let conn = streams
            .get(&port)
            .ok_or(DispatchError::NotConnected(port))?;
        match conn.outbox.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // The reader sees the shutdown and reports the port as gone.
                let _ = conn.stream.shutdown(Shutdown::Both);
                Err(DispatchError::Stalled(port))
            }
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::NotConnected(port)),
        }
    }

    fn accept(&mut self, events: &EventSender) -> Option<PortId> {
        let stream = self.pending.lock().pop_front()?;
        let port = PortId::Client(self.next_client);
        self.next_client += 1;
        attach(port, stream, &self.streams, events);
        Some(port)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(running) = self.listening.take() {
            running.store(false, Ordering::SeqCst);
        }
        for (_, conn) in self.streams.lock().drain() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}
