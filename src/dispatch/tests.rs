// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener},
    time::{Duration, Instant},
};

use serial_test::serial;

use super::{tcp::TcpTransport, *};
use crate::protocol::RspStatus;

#[derive(Default)]
struct MockTransport {
    opened: Vec<PortId>,
    sent: Vec<(PortId, Message)>,
    waiting: u32,
}

impl Transport for MockTransport {
    fn open(&mut self, port: PortId, events: &EventSender) {
        self.opened.push(port);
        events.post(port, Event::Connected);
    }

    fn close(&mut self, _: PortId) {}

    fn send(&mut self, port: PortId, message: &Message) -> Result<(), DispatchError> {
        self.sent.push((port, message.clone()));
        Ok(())
    }

    fn accept(&mut self, _: &EventSender) -> Option<PortId> {
        if self.waiting == 0 {
            return None;
        }
        self.waiting -= 1;
        Some(PortId::Client(self.waiting))
    }
}

/// Records every event and reacts to a few of them.
struct Recorder {
    events: Vec<(PortId, Event)>,
    stop: StopHandle,
    stop_after: usize,
}

impl Recorder {
    fn new(stop: StopHandle, stop_after: usize) -> Recorder {
        Recorder {
            events: vec![],
            stop,
            stop_after,
        }
    }

    fn count(&self, wanted: &Event) -> usize {
        self.events.iter().filter(|(_, e)| e == wanted).count()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("recorder failed")]
struct RecorderError;

impl EventHandler for Recorder {
    type Error = RecorderError;

    fn handle(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> Result<EventStatus, RecorderError> {
        match &event {
            Event::Entry => ctx.open(PortId::Driver),
            Event::Connected => ctx.send(port, Message::RspGetconfig),
            Event::AcceptRequest => {
                if ctx.accept().is_none() {
                    return Err(RecorderError);
                }
            }
            _ => (),
        }
        self.events.push((port, event));
        if self.events.len() >= self.stop_after {
            self.stop.stop();
        }
        Ok(EventStatus::Handled)
    }
}

#[test]
fn test_init_delivers_entry() {
    let mut dispatcher = Dispatcher::new(MockTransport::default());
    let mut recorder = Recorder::new(dispatcher.stop_handle(), usize::MAX);
    dispatcher.init(&mut recorder).unwrap();
    assert_eq!(recorder.events, vec![(PortId::Local, Event::Entry)]);
    assert_eq!(dispatcher.transport().opened, vec![PortId::Driver]);

    // Opening posted a connection event, which sends on delivery.
    assert_eq!(dispatcher.run_pending(&mut recorder).unwrap(), 1);
    assert_eq!(recorder.events[1], (PortId::Driver, Event::Connected));
    assert_eq!(
        dispatcher.transport().sent,
        vec![(PortId::Driver, Message::RspGetconfig)]
    );
}

#[test]
fn test_stop_handle_ends_run() {
    let mut dispatcher = Dispatcher::new(MockTransport::default());
    let mut recorder = Recorder::new(dispatcher.stop_handle(), usize::MAX);
    let events = dispatcher.event_sender();
    events.post(PortId::Acceptor, Event::Disconnected);
    events.post(PortId::Acceptor, Event::Disconnected);
    dispatcher.stop_handle().stop();
    events.post(PortId::Acceptor, Event::Disconnected);
    dispatcher.run(&mut recorder).unwrap();
    // Events queued behind the stop aren't delivered.
    assert_eq!(recorder.events.len(), 2);
}

#[test]
fn test_handler_errors_end_run() {
    let mut dispatcher = Dispatcher::new(MockTransport::default());
    let mut recorder = Recorder::new(dispatcher.stop_handle(), usize::MAX);
    dispatcher.event_sender().post(PortId::Acceptor, Event::AcceptRequest);
    assert!(dispatcher.run(&mut recorder).is_err());
}

#[test]
fn test_accept() {
    let mut dispatcher = Dispatcher::new(MockTransport {
        waiting: 1,
        ..Default::default()
    });
    let mut recorder = Recorder::new(dispatcher.stop_handle(), 1);
    dispatcher.event_sender().post(PortId::Acceptor, Event::AcceptRequest);
    dispatcher.run(&mut recorder).unwrap();
    assert_eq!(dispatcher.transport().waiting, 0);
}

/// Sets timers from inside the handler.
struct TimerUser {
    inner: Recorder,
    one_shot: Option<TimerId>,
    periodic: Option<TimerId>,
    cancelled: Option<TimerId>,
}

impl EventHandler for TimerUser {
    type Error = RecorderError;

    fn handle(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> Result<EventStatus, RecorderError> {
        if event == Event::Entry {
            self.one_shot = Some(ctx.set_timer(PortId::Local, Duration::from_millis(1), None));
            self.periodic = Some(ctx.set_timer(
                PortId::Local,
                Duration::from_millis(1),
                Some(Duration::from_millis(5)),
            ));
            let cancelled = ctx.set_timer(PortId::Local, Duration::from_millis(200), None);
            ctx.cancel_timer(cancelled);
            self.cancelled = Some(cancelled);
        }
        if let (Event::Timer(id), Some(periodic)) = (&event, self.periodic) {
            // Stop after the periodic timer has fired a few times.
            if *id == periodic && self.inner.count(&Event::Timer(periodic)) == 3 {
                ctx.cancel_all_timers();
                self.inner.stop.stop();
            }
        }
        self.inner.events.push((port, event));
        Ok(EventStatus::Handled)
    }
}

#[test]
fn test_timers() {
    let mut dispatcher = Dispatcher::new(MockTransport::default());
    let mut user = TimerUser {
        inner: Recorder::new(dispatcher.stop_handle(), usize::MAX),
        one_shot: None,
        periodic: None,
        cancelled: None,
    };
    dispatcher.init(&mut user).unwrap();
    dispatcher.run(&mut user).unwrap();

    let one_shot = Event::Timer(user.one_shot.unwrap());
    let periodic = Event::Timer(user.periodic.unwrap());
    let cancelled = Event::Timer(user.cancelled.unwrap());
    assert_eq!(user.inner.count(&one_shot), 1);
    assert_eq!(user.inner.count(&periodic), 4);
    assert_eq!(user.inner.count(&cancelled), 0);
}

/// Plays the hardware driver: answers a configuration request.
struct DriverHandshake {
    stop: StopHandle,
    acks: Vec<Message>,
    connected: bool,
}

impl EventHandler for DriverHandshake {
    type Error = RecorderError;

    fn handle(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> Result<EventStatus, RecorderError> {
        match (port, event) {
            (PortId::Local, Event::Entry) => {
                ctx.open(PortId::Driver);
                ctx.set_timer(PortId::Local, Duration::from_secs(10), None);
            }
            (PortId::Local, Event::Timer(_)) => return Err(RecorderError),
            (PortId::Driver, Event::Connected) => {
                self.connected = true;
                ctx.send(PortId::Driver, Message::RspGetconfig);
            }
            (PortId::Driver, Event::Message(m)) => {
                self.acks.push(m);
                ctx.close(PortId::Driver);
                self.stop.stop();
            }
            // The fake driver hangs up once it has answered.
            (PortId::Driver, Event::Disconnected) if self.acks.is_empty() => {
                return Err(RecorderError)
            }
            _ => return Ok(EventStatus::NotHandled),
        }
        Ok(EventStatus::Handled)
    }
}

#[test]
#[serial]
fn test_tcp_driver_round_trip() {
    let driver = TcpListener::bind("127.0.0.1:0").unwrap();
    let driver_addr = driver.local_addr().unwrap();
    let fake_driver = std::thread::spawn(move || {
        let (stream, _) = driver.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let request = Message::from_line(&line).unwrap();
        let ack = Message::RspGetconfigAck {
            n_rsp_boards: 4,
            n_rcus: 32,
        };
        let mut writer = stream;
        writeln!(writer, "{}", ack.to_line().unwrap()).unwrap();
        request
    });

    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let transport = TcpTransport::new(listen, driver_addr, Duration::from_secs(5));
    let mut dispatcher = Dispatcher::new(transport);
    let mut handler = DriverHandshake {
        stop: dispatcher.stop_handle(),
        acks: vec![],
        connected: false,
    };
    dispatcher.init(&mut handler).unwrap();
    dispatcher.run(&mut handler).unwrap();

    assert!(handler.connected);
    assert_eq!(fake_driver.join().unwrap(), Message::RspGetconfig);
    assert_eq!(
        handler.acks,
        vec![Message::RspGetconfigAck {
            n_rsp_boards: 4,
            n_rcus: 32
        }]
    );
}

#[test]
#[serial]
fn test_tcp_acceptor_queues_clients() {
    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let mut transport = TcpTransport::new(listen, unused, Duration::from_millis(100));
    let dispatcher = Dispatcher::new(MockTransport::default());
    let events = dispatcher.event_sender();
    transport.open(PortId::Acceptor, &events);
    let addr = transport.local_addr().unwrap();

    let client = std::net::TcpStream::connect(addr).unwrap();
    let start = Instant::now();
    let mut accepted = None;
    while accepted.is_none() && start.elapsed() < Duration::from_secs(5) {
        accepted = transport.accept(&events);
        std::thread::sleep(Duration::from_millis(10));
    }
    let port = accepted.unwrap();
    assert_eq!(port, PortId::Client(0));

    transport
        .send(
            port,
            &Message::RspSubclockAck {
                status: RspStatus::Success,
            },
        )
        .unwrap();
    let mut line = String::new();
    BufReader::new(client.try_clone().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert!(line.ends_with('\n'));
    assert_eq!(
        Message::from_line(&line).unwrap(),
        Message::RspSubclockAck {
            status: RspStatus::Success
        }
    );

    transport.close(port);
    assert!(matches!(
        transport.send(port, &Message::RspGetconfig),
        Err(DispatchError::NotConnected(PortId::Client(0)))
    ));
    transport.close(PortId::Acceptor);
}

/// A transport listening on a free port, with its acceptor events going to
/// `events`.
fn listening_transport(events: &EventSender) -> (TcpTransport, SocketAddr) {
    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let mut transport = TcpTransport::new(listen, unused, Duration::from_millis(100));
    transport.open(PortId::Acceptor, events);
    let addr = transport.local_addr().unwrap();
    (transport, addr)
}

fn accept_client(transport: &mut TcpTransport, events: &EventSender) -> PortId {
    let start = Instant::now();
    loop {
        if let Some(port) = transport.accept(events) {
            return port;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "no client arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_disconnect(dispatcher: &mut Dispatcher<MockTransport>, recorder: &mut Recorder) {
    let start = Instant::now();
    while recorder.count(&Event::Disconnected) == 0 && start.elapsed() < Duration::from_secs(5) {
        dispatcher.run_pending(recorder).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
#[serial]
fn test_tcp_overlong_line_drops_client() {
    let acceptor = Dispatcher::new(MockTransport::default());
    let (mut transport, addr) = listening_transport(&acceptor.event_sender());
    let mut client = std::net::TcpStream::connect(addr).unwrap();

    let mut dispatcher = Dispatcher::new(MockTransport::default());
    let mut recorder = Recorder::new(dispatcher.stop_handle(), usize::MAX);
    let port = accept_client(&mut transport, &dispatcher.event_sender());

    writeln!(client, "{}", Message::RspGetconfig.to_line().unwrap()).unwrap();
    // The server may hang up part way through.
    let _ = client.write_all(&vec![b'x'; tcp::MAX_LINE_LENGTH + 10]);

    wait_for_disconnect(&mut dispatcher, &mut recorder);
    assert_eq!(
        recorder.events,
        vec![
            (port, Event::Connected),
            (port, Event::Message(Message::RspGetconfig)),
            (port, Event::Disconnected),
        ]
    );
    assert!(matches!(
        transport.send(port, &Message::RspGetconfig),
        Err(DispatchError::NotConnected(_))
    ));
    transport.close(PortId::Acceptor);
}

#[test]
#[serial]
fn test_tcp_client_that_stops_reading_is_dropped() {
    let acceptor = Dispatcher::new(MockTransport::default());
    let (mut transport, addr) = listening_transport(&acceptor.event_sender());
    // Never read from.
    let _client = std::net::TcpStream::connect(addr).unwrap();

    let mut dispatcher = Dispatcher::new(MockTransport::default());
    let mut recorder = Recorder::new(dispatcher.stop_handle(), usize::MAX);
    let port = accept_client(&mut transport, &dispatcher.event_sender());

    let big = Message::RspSetrcu {
        rcu_mask: (0..10_000).collect(),
        control: 0,
    };
    let start = Instant::now();
    // Sending never blocks; once the socket and the outbox are full, the
    // client is given up on.
    let result = (0..100_000)
        .map(|_| transport.send(port, &big))
        .find(|r| r.is_err());
    assert!(
        matches!(result, Some(Err(DispatchError::Stalled(p))) if p == port),
        "{result:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(30));

    wait_for_disconnect(&mut dispatcher, &mut recorder);
    assert_eq!(recorder.count(&Event::Disconnected), 1);
    transport.close(PortId::Acceptor);
}
