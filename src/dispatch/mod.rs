// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The event substrate.
//!
//! A [`Dispatcher`] delivers one event at a time to an [`EventHandler`]. While
//! handling an event, the handler talks to the outside world only through a
//! [`PortContext`]: sending messages, opening and closing ports, accepting
//! connections and setting timers. The dispatcher is an ordinary value; make
//! one, [`Dispatcher::init`] it, [`Dispatcher::run`] it and stop it from
//! anywhere with a [`StopHandle`].

mod error;
pub mod tcp;
#[cfg(test)]
mod tests;

pub use error::DispatchError;

use std::{collections::HashMap, fmt::Display, thread, time::Duration};

use crossbeam_channel::{after, select, tick, unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::protocol::Message;

/// A connection endpoint, as seen by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortId {
    /// The handler itself; entry events and the handler's own timers.
    Local,

    /// The listening port calibration clients connect to.
    Acceptor,

    /// The uplink to the station hardware driver.
    Driver,

    /// An accepted calibration client.
    Client(u32),
}

impl Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortId::Local => write!(f, "local"),
            PortId::Acceptor => write!(f, "acceptor"),
            PortId::Driver => write!(f, "driver"),
            PortId::Client(n) => write!(f, "client {n}"),
        }
    }
}

pub type TimerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Delivered once, by [`Dispatcher::init`].
    Entry,

    /// An opened port is now usable.
    Connected,

    /// A port lost its connection (or never got one).
    Disconnected,

    /// A client is waiting on the acceptor; call [`PortContext::accept`].
    AcceptRequest,

    Timer(TimerId),

    Message(Message),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Entry => "entry",
            Event::Connected => "connected",
            Event::Disconnected => "disconnected",
            Event::AcceptRequest => "accept request",
            Event::Timer(_) => "timer",
            Event::Message(m) => m.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Handled,
    NotHandled,
}

/// What an event handler may do to the outside world.
pub trait PortContext {
    /// Send a message. Failures are the transport's to report; the port will
    /// get a [`Event::Disconnected`] if it's gone.
    fn send(&mut self, port: PortId, message: Message);

    fn open(&mut self, port: PortId);

    fn close(&mut self, port: PortId);

    /// Fire [`Event::Timer`] on `port` after `delay`, then every `period` if
    /// one is given.
    fn set_timer(&mut self, port: PortId, delay: Duration, period: Option<Duration>) -> TimerId;

    fn cancel_timer(&mut self, timer: TimerId);

    fn cancel_all_timers(&mut self);

    /// Take a waiting connection off the acceptor.
    fn accept(&mut self) -> Option<PortId>;
}

pub trait EventHandler {
    type Error: std::error::Error;

    fn handle(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> Result<EventStatus, Self::Error>;
}

/// The byte-moving half of the substrate. Implementations report what
/// happens on their ports by posting events to the [`EventSender`] they're
/// given.
pub trait Transport {
    fn open(&mut self, port: PortId, events: &EventSender);

    fn close(&mut self, port: PortId);

    fn send(&mut self, port: PortId, message: &Message) -> Result<(), DispatchError>;

    fn accept(&mut self, events: &EventSender) -> Option<PortId>;
}

#[derive(Debug)]
enum Envelope {
    Event { port: PortId, event: Event },
    Stop,
}

/// Posts events into a dispatcher's queue from any thread.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Envelope>,
}

impl EventSender {
    /// Returns `false` if the dispatcher has gone away.
    pub fn post(&self, port: PortId, event: Event) -> bool {
        self.tx.send(Envelope::Event { port, event }).is_ok()
    }
}

/// Stops a running dispatcher after the event it's currently handling.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<Envelope>,
}

impl StopHandle {
    pub fn stop(&self) {
        // If the dispatcher is already gone there's nothing to stop.
        let _ = self.tx.send(Envelope::Stop);
    }
}

struct TimerEntry {
    periodic: bool,

    /// Dropping this cancels the timer thread.
    _cancel: Sender<()>,
}

/// Timers are threads; each gets a cancel channel that is dropped to stop
/// it.
struct Timers {
    events: EventSender,
    next_id: TimerId,
    active: HashMap<TimerId, TimerEntry>,
}

impl Timers {
    fn set(&mut self, port: PortId, delay: Duration, period: Option<Duration>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        let events = self.events.clone();
        thread::Builder::new()
            .name(format!("timer-{id}"))
            .spawn(move || {
                select! {
                    recv(cancel_rx) -> _ => return,
                    recv(after(delay)) -> _ => (),
                }
                if !events.post(port, Event::Timer(id)) {
                    return;
                }
                let period = match period {
                    Some(p) => p,
                    None => return,
                };
                let ticker = tick(period);
                loop {
                    select! {
                        recv(cancel_rx) -> _ => return,
                        recv(ticker) -> _ => {
                            if !events.post(port, Event::Timer(id)) {
                                return;
                            }
                        }
                    }
                }
            })
            .expect("OS can create threads");

        self.active.insert(
            id,
            TimerEntry {
                periodic: period.is_some(),
                _cancel: cancel_tx,
            },
        );
        trace!("Set timer {id} on {port}");
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if self.active.remove(&id).is_some() {
            trace!("Cancelled timer {id}");
        }
    }

    fn cancel_all(&mut self) {
        trace!("Cancelling {} timers", self.active.len());
        self.active.clear();
    }

    /// Should a fired timer still be delivered? One-shot timers are forgotten
    /// once they've fired.
    fn fired(&mut self, id: TimerId) -> bool {
        match self.active.get(&id).map(|t| t.periodic) {
            Some(true) => true,
            Some(false) => {
                self.active.remove(&id);
                true
            }
            None => false,
        }
    }
}

/// The [`PortContext`] a dispatcher hands to its handler.
struct DispatchContext<'a, T: Transport> {
    transport: &'a mut T,
    timers: &'a mut Timers,
}

impl<T: Transport> PortContext for DispatchContext<'_, T> {
    fn send(&mut self, port: PortId, message: Message) {
        trace!("Sending {} to {port}", message.name());
        if let Err(e) = self.transport.send(port, &message) {
            warn!("Couldn't send {} to {port}: {e}", message.name());
        }
    }

    fn open(&mut self, port: PortId) {
        debug!("Opening {port}");
        self.transport.open(port, &self.timers.events);
    }

    fn close(&mut self, port: PortId) {
        debug!("Closing {port}");
        self.transport.close(port);
    }

    fn set_timer(&mut self, port: PortId, delay: Duration, period: Option<Duration>) -> TimerId {
        self.timers.set(port, delay, period)
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.timers.cancel(timer);
    }

    fn cancel_all_timers(&mut self) {
        self.timers.cancel_all();
    }

    fn accept(&mut self) -> Option<PortId> {
        self.transport.accept(&self.timers.events)
    }
}

pub struct Dispatcher<T: Transport> {
    transport: T,
    timers: Timers,
    rx: Receiver<Envelope>,
    tx: Sender<Envelope>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T) -> Dispatcher<T> {
        let (tx, rx) = unbounded();
        Dispatcher {
            transport,
            timers: Timers {
                events: EventSender { tx: tx.clone() },
                next_id: 0,
                active: HashMap::new(),
            },
            rx,
            tx,
        }
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Deliver the entry event.
    pub fn init<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), H::Error> {
        self.deliver(handler, PortId::Local, Event::Entry)
    }

    /// Deliver events until stopped or until the handler fails.
    pub fn run<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), H::Error> {
        loop {
            // `self` holds a sender, so the queue never disconnects.
            let envelope = match self.rx.recv() {
                Ok(e) => e,
                Err(_) => return Ok(()),
            };
            match envelope {
                Envelope::Stop => {
                    debug!("Dispatcher stopping");
                    self.timers.cancel_all();
                    return Ok(());
                }
                Envelope::Event { port, event } => {
                    if let Event::Timer(id) = event {
                        if !self.timers.fired(id) {
                            trace!("Dropping cancelled timer {id}");
                            continue;
                        }
                    }
                    self.deliver(handler, port, event)?;
                }
            }
        }
    }

    /// Deliver whatever is queued right now, then return. Returns the number
    /// of events delivered.
    pub fn run_pending<H: EventHandler>(&mut self, handler: &mut H) -> Result<usize, H::Error> {
        let mut num_delivered = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            match envelope {
                Envelope::Stop => break,
                Envelope::Event { port, event } => {
                    if let Event::Timer(id) = event {
                        if !self.timers.fired(id) {
                            continue;
                        }
                    }
                    self.deliver(handler, port, event)?;
                    num_delivered += 1;
                }
            }
        }
        Ok(num_delivered)
    }

    fn deliver<H: EventHandler>(
        &mut self,
        handler: &mut H,
        port: PortId,
        event: Event,
    ) -> Result<(), H::Error> {
        let mut ctx = DispatchContext {
            transport: &mut self.transport,
            timers: &mut self.timers,
        };
        let kind = event.kind();
        if handler.handle(event, port, &mut ctx)? == EventStatus::NotHandled {
            trace!("Unhandled {kind} on {port}");
        }
        Ok(())
    }
}
