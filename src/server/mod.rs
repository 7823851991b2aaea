// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The calibration server.
//!
//! The server starts in the initial state, in which it shakes hands with the
//! station driver: it asks for the hardware configuration, then the sampling
//! clock, then subscribes to clock changes. Only when the subscription is
//! acknowledged does it become enabled. A refusal or a missing reply during
//! the handshake is fatal.
//!
//! Once enabled, every tick it tries to swap the ACC buffers. After a swap it
//! runs registry maintenance (removals, then additions), calibrates every
//! live subarray against the new front ACC and sends the results to
//! subscribers, always in that order.

mod cal_thread;
mod error;
#[cfg(test)]
mod tests;

pub use error::ServerError;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    acc::{write_acc_dump, AccBuffers},
    array::AntennaArrays,
    bitset::{RcuMask, SubbandSet},
    calibrate::Calibrator,
    constants::{CLOCK_SUBSCRIPTION_PERIOD, MAX_NYQUIST_ZONE, VALID_CLOCKS_MHZ},
    dispatch::{Event, EventHandler, EventStatus, PortContext, PortId, TimerId},
    protocol::{CalStatus, GainsPayload, Message},
    subarray::{SpectralWindow, SubArray, SubArrays, Subscription, SubscriptionHandle},
};
use cal_thread::CalThread;

/// Where calibration runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    /// On the event thread, inside the tick.
    #[default]
    #[strum(serialize = "inline")]
    Inline,

    /// On a worker thread; results go out on the first tick after it
    /// finishes.
    #[strum(serialize = "thread")]
    Thread,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_period: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_interval: Duration,
    pub mode: CalibrationMode,

    /// If set, every front ACC is written here after a swap.
    pub dump_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Connecting,
    AwaitConfig,
    AwaitClock,
    AwaitSubscription,
}

impl HandshakeStage {
    /// The request whose reply this stage waits for.
    fn request(self) -> &'static str {
        match self {
            HandshakeStage::Connecting => "a connection",
            HandshakeStage::AwaitConfig => "RSP_GETCONFIG",
            HandshakeStage::AwaitClock => "RSP_GETCLOCK",
            HandshakeStage::AwaitSubscription => "RSP_SUBCLOCK",
        }
    }
}

#[derive(Debug)]
enum ServerState {
    Initial {
        stage: HandshakeStage,

        /// Fires if the driver doesn't reply in time.
        deadline: Option<TimerId>,

        /// Fires to retry connecting to the driver.
        reconnect: Option<TimerId>,
    },
    Enabled {
        tick: TimerId,
    },
}

/// The hardware configuration reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardware {
    pub n_rsp_boards: u32,
    pub n_rcus: u32,
}

/// What happened during one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub released_ports: usize,
    pub swapped: bool,
    pub removed: usize,
    pub added: usize,
    pub calibrated: usize,
    pub updated: usize,

    /// In threaded mode, was a calibration handed to the worker?
    pub dispatched: bool,
}

#[derive(Debug, Default)]
struct Client {
    /// Subarrays this client started.
    subarrays: Vec<String>,

    /// Owned here; subarrays only hold weak references.
    subscriptions: Vec<Arc<Subscription>>,
}

pub struct CalServer {
    config: ServerConfig,
    arrays: AntennaArrays,
    accs: Arc<AccBuffers>,
    subarrays: Arc<SubArrays>,
    calibrator: Option<Arc<dyn Calibrator>>,
    cal_thread: Option<CalThread>,

    state: ServerState,
    hardware: Option<Hardware>,

    /// \[MHz\]
    clock_mhz: u32,

    clients: BTreeMap<PortId, Client>,

    /// Ports to close at the start of the next tick.
    dead_ports: Vec<PortId>,

    next_handle: SubscriptionHandle,
    last_tick: TickReport,
}

impl CalServer {
    pub fn new(
        config: ServerConfig,
        arrays: AntennaArrays,
        accs: Arc<AccBuffers>,
        calibrator: Option<Arc<dyn Calibrator>>,
    ) -> CalServer {
        let subarrays = Arc::new(SubArrays::new());
        let cal_thread = match config.mode {
            CalibrationMode::Inline => None,
            CalibrationMode::Thread => Some(CalThread::spawn(
                Arc::clone(&subarrays),
                calibrator.clone(),
            )),
        };
        CalServer {
            config,
            arrays,
            accs,
            subarrays,
            calibrator,
            cal_thread,
            state: ServerState::Initial {
                stage: HandshakeStage::Connecting,
                deadline: None,
                reconnect: None,
            },
            hardware: None,
            clock_mhz: 0,
            clients: BTreeMap::new(),
            dead_ports: vec![],
            next_handle: 1,
            last_tick: TickReport::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ServerState::Enabled { .. })
    }

    /// `None` once enabled.
    pub fn handshake_stage(&self) -> Option<HandshakeStage> {
        match self.state {
            ServerState::Initial { stage, .. } => Some(stage),
            ServerState::Enabled { .. } => None,
        }
    }

    pub fn hardware(&self) -> Option<Hardware> {
        self.hardware
    }

    pub fn clock_mhz(&self) -> u32 {
        self.clock_mhz
    }

    pub fn subarrays(&self) -> &SubArrays {
        &self.subarrays
    }

    pub fn accs(&self) -> &Arc<AccBuffers> {
        &self.accs
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn last_tick(&self) -> TickReport {
        self.last_tick
    }

    /// Block until the calibration thread (if any) is idle. Returns `false`
    /// on timeout.
    pub fn wait_for_calibration(&mut self, timeout: Duration) -> bool {
        match self.cal_thread.as_mut() {
            Some(t) => t.wait(timeout),
            None => true,
        }
    }

    fn enter_initial(&mut self, ctx: &mut dyn PortContext) {
        info!("Waiting for the station driver");
        self.state = ServerState::Initial {
            stage: HandshakeStage::Connecting,
            deadline: None,
            reconnect: None,
        };
        ctx.open(PortId::Driver);
    }

    fn enter_enabled(&mut self, ctx: &mut dyn PortContext) {
        let period = self.config.tick_period;
        let tick = ctx.set_timer(PortId::Local, period, Some(period));
        self.state = ServerState::Enabled { tick };
        info!("Calibration server enabled; sampling clock {} MHz", self.clock_mhz);
        // Clients may have been waiting during the handshake.
        while let Some(port) = ctx.accept() {
            self.register_client(port);
        }
    }

    /// Move to the next handshake stage, sending its request with a fresh
    /// deadline.
    fn advance_handshake(
        &mut self,
        ctx: &mut dyn PortContext,
        stage: HandshakeStage,
        request: Message,
    ) {
        if let ServerState::Initial {
            deadline: Some(old),
            ..
        } = self.state
        {
            ctx.cancel_timer(old);
        }
        trace!("Handshake: sending {}", request.name());
        ctx.send(PortId::Driver, request);
        let deadline = ctx.set_timer(PortId::Local, self.config.handshake_timeout, None);
        self.state = ServerState::Initial {
            stage,
            deadline: Some(deadline),
            reconnect: None,
        };
    }

    fn handle_initial(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> Result<EventStatus, ServerError> {
        let (stage, deadline, reconnect) = match self.state {
            ServerState::Initial {
                stage,
                deadline,
                reconnect,
            } => (stage, deadline, reconnect),
            ServerState::Enabled { .. } => return Ok(EventStatus::NotHandled),
        };

        match (port, event) {
            (PortId::Driver, Event::Connected) => {
                debug!("Connected to the station driver");
                self.advance_handshake(ctx, HandshakeStage::AwaitConfig, Message::RspGetconfig);
            }

            (PortId::Driver, Event::Disconnected) => {
                if let Some(d) = deadline {
                    ctx.cancel_timer(d);
                }
                debug!(
                    "No station driver; retrying in {:?}",
                    self.config.reconnect_interval
                );
                let reconnect =
                    ctx.set_timer(PortId::Local, self.config.reconnect_interval, None);
                self.state = ServerState::Initial {
                    stage: HandshakeStage::Connecting,
                    deadline: None,
                    reconnect: Some(reconnect),
                };
            }

            (PortId::Local, Event::Timer(id)) if Some(id) == reconnect => {
                self.state = ServerState::Initial {
                    stage,
                    deadline,
                    reconnect: None,
                };
                ctx.open(PortId::Driver);
            }

            (PortId::Local, Event::Timer(id)) if Some(id) == deadline => {
                let e = ServerError::HandshakeTimeout {
                    request: stage.request(),
                    timeout: self.config.handshake_timeout,
                };
                error!("{e}");
                return Err(e);
            }

            (
                PortId::Driver,
                Event::Message(Message::RspGetconfigAck {
                    n_rsp_boards,
                    n_rcus,
                }),
            ) if stage == HandshakeStage::AwaitConfig => {
                let expected = self.accs.shape().1;
                if n_rcus as usize != expected {
                    let e = ServerError::RcuCount {
                        expected,
                        got: n_rcus,
                    };
                    error!("{e}");
                    return Err(e);
                }
                debug!("Station has {n_rsp_boards} RSP boards and {n_rcus} RCUs");
                self.hardware = Some(Hardware {
                    n_rsp_boards,
                    n_rcus,
                });
                self.advance_handshake(
                    ctx,
                    HandshakeStage::AwaitClock,
                    Message::RspGetclock { cache: false },
                );
            }

            (PortId::Driver, Event::Message(Message::RspGetclockAck { clock_mhz, status }))
                if stage == HandshakeStage::AwaitClock =>
            {
                if !status.is_success() {
                    let e = ServerError::HandshakeRefused {
                        request: stage.request(),
                    };
                    error!("{e}");
                    return Err(e);
                }
                if !VALID_CLOCKS_MHZ.contains(&clock_mhz) {
                    let e = ServerError::Clock(clock_mhz);
                    error!("{e}");
                    return Err(e);
                }
                self.clock_mhz = clock_mhz;
                self.advance_handshake(
                    ctx,
                    HandshakeStage::AwaitSubscription,
                    Message::RspSubclock {
                        period: CLOCK_SUBSCRIPTION_PERIOD,
                    },
                );
            }

            (PortId::Driver, Event::Message(Message::RspSubclockAck { status }))
                if stage == HandshakeStage::AwaitSubscription =>
            {
                if let Some(d) = deadline {
                    ctx.cancel_timer(d);
                }
                if !status.is_success() {
                    let e = ServerError::HandshakeRefused {
                        request: stage.request(),
                    };
                    error!("{e}");
                    return Err(e);
                }
                self.enter_enabled(ctx);
            }

            (port, event) => return Ok(self.handle_common(event, port, ctx)),
        }

        Ok(EventStatus::Handled)
    }

    fn handle_enabled(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> EventStatus {
        let tick = match self.state {
            ServerState::Enabled { tick } => tick,
            ServerState::Initial { .. } => return EventStatus::NotHandled,
        };

        match (port, event) {
            (PortId::Local, Event::Timer(id)) if id == tick => {
                self.last_tick = self.tick(ctx);
            }

            (PortId::Acceptor, Event::AcceptRequest) => {
                while let Some(port) = ctx.accept() {
                    self.register_client(port);
                }
            }

            (PortId::Driver, Event::Disconnected) => {
                warn!("Lost the station driver; starting over");
                ctx.cancel_all_timers();
                self.hardware = None;
                self.enter_initial(ctx);
            }

            (PortId::Driver, Event::Message(Message::RspSetrcuAck { status })) => {
                if !status.is_success() {
                    warn!("The station driver refused an RCU setting");
                }
            }

            (port, event) => return self.handle_common(event, port, ctx),
        }

        EventStatus::Handled
    }

    /// Events handled the same way in every state.
    fn handle_common(&mut self, event: Event, port: PortId, ctx: &mut dyn PortContext) -> EventStatus {
        match (port, event) {
            (PortId::Local, Event::Entry) => {
                ctx.open(PortId::Acceptor);
                self.enter_initial(ctx);
            }

            (PortId::Driver, Event::Message(Message::RspUpdclock { clock_mhz })) => {
                if VALID_CLOCKS_MHZ.contains(&clock_mhz) {
                    info!("Sampling clock changed to {clock_mhz} MHz");
                    self.clock_mhz = clock_mhz;
                } else {
                    warn!("Ignoring an unsupported {clock_mhz} MHz sampling clock");
                }
            }

            (PortId::Client(_), Event::Message(request)) => {
                return self.handle_request(port, request, ctx);
            }

            (PortId::Client(_), Event::Disconnected) => self.client_disconnected(port),

            (PortId::Client(_), Event::Connected) | (PortId::Acceptor, Event::Connected) => (),

            _ => return EventStatus::NotHandled,
        }
        EventStatus::Handled
    }

    fn register_client(&mut self, port: PortId) {
        debug!("Accepted {port}");
        self.clients.entry(port).or_default();
    }

    /// Tear down everything a client owned. Its port can't be released while
    /// its own event is being handled, so that waits for the next tick.
    fn client_disconnected(&mut self, port: PortId) {
        debug!("{port} disconnected");
        if let Some(client) = self.clients.remove(&port) {
            for name in client.subarrays {
                match self.subarrays.schedule_remove(&name) {
                    Ok(_) => debug!("Scheduled removal of '{name}' owned by {port}"),
                    Err(e) => trace!("{e}"),
                }
            }
            // Dropping the subscriptions detaches them everywhere.
            drop(client.subscriptions);
        }
        self.dead_ports.push(port);
    }

    /// Every request gets exactly one acknowledgement.
    fn handle_request(
        &mut self,
        port: PortId,
        request: Message,
        ctx: &mut dyn PortContext,
    ) -> EventStatus {
        let ack = match request {
            Message::CalStart {
                name,
                parent,
                rcu_mask,
                nyquist_zone,
                rcu_control,
            } => {
                let status = self.start(port, &name, &parent, &rcu_mask, nyquist_zone, rcu_control);
                if status == CalStatus::Success {
                    ctx.send(
                        PortId::Driver,
                        Message::RspSetrcu {
                            rcu_mask,
                            control: rcu_control,
                        },
                    );
                }
                Message::CalStartAck { name, status }
            }

            Message::CalStop { name } => {
                let status = self.stop(&name);
                Message::CalStopAck { name, status }
            }

            Message::CalSubscribe { name, subbands } => self.subscribe(port, &name, subbands),

            Message::CalUnsubscribe { name, handle } => {
                let status = self.unsubscribe(port, &name, handle);
                Message::CalUnsubscribeAck {
                    name,
                    handle,
                    status,
                }
            }

            other => {
                warn!("{port} sent an unexpected {}", other.name());
                return EventStatus::NotHandled;
            }
        };
        debug!("{} to {port}", ack.name());
        ctx.send(port, ack);
        EventStatus::Handled
    }

    fn start(
        &mut self,
        port: PortId,
        name: &str,
        parent: &str,
        rcu_mask: &RcuMask,
        nyquist_zone: u8,
        rcu_control: u32,
    ) -> CalStatus {
        let parent = match self.arrays.get(parent) {
            Some(p) => p,
            None => {
                debug!("CAL_START '{name}': unknown parent array '{parent}'");
                return CalStatus::ErrNoParent;
            }
        };
        if !(1..=MAX_NYQUIST_ZONE).contains(&nyquist_zone) {
            debug!("CAL_START '{name}': Nyquist zone {nyquist_zone} is out of range");
            return CalStatus::ErrRange;
        }
        // The parent array may describe more antennas than the station has
        // RCUs.
        let num_rcus = self.accs.shape().1;
        if let Some(max) = rcu_mask.max().filter(|&max| max >= num_rcus) {
            debug!("CAL_START '{name}': RCU {max} is beyond the station's {num_rcus} RCUs");
            return CalStatus::ErrRange;
        }
        let spectral_window = SpectralWindow {
            sampling_frequency: f64::from(self.clock_mhz) * 1e6,
            nyquist_zone,
            num_subbands: self.accs.shape().0,
            rcu_control,
        };
        let subarray = match SubArray::new(name, parent, rcu_mask, spectral_window) {
            Ok(s) => s,
            Err(e) => {
                debug!("CAL_START '{name}': {e}");
                return CalStatus::ErrRange;
            }
        };
        if let Err(e) = self.subarrays.schedule_add(subarray) {
            debug!("CAL_START: {e}");
            return CalStatus::ErrRange;
        }
        if let Some(client) = self.clients.get_mut(&port) {
            client.subarrays.push(name.to_string());
        }
        info!("Started subarray '{name}'");
        CalStatus::Success
    }

    fn stop(&mut self, name: &str) -> CalStatus {
        match self.subarrays.schedule_remove(name) {
            Ok(_) => {
                for client in self.clients.values_mut() {
                    client.subarrays.retain(|n| n != name);
                }
                info!("Stopped subarray '{name}'");
                CalStatus::Success
            }
            Err(e) => {
                debug!("CAL_STOP: {e}");
                CalStatus::ErrNoSubarray
            }
        }
    }

    fn subscribe(&mut self, port: PortId, name: &str, subbands: SubbandSet) -> Message {
        let refuse = |status| Message::CalSubscribeAck {
            status,
            handle: 0,
            subarray: None,
        };
        if subbands.is_empty() || subbands.max().unwrap_or(0) >= self.accs.shape().0 {
            return refuse(CalStatus::ErrRange);
        }
        let client = match self.clients.get_mut(&port) {
            Some(c) => c,
            None => return refuse(CalStatus::ErrRange),
        };

        let subscription = Arc::new(Subscription {
            handle: self.next_handle,
            port,
            subarray: name.to_string(),
            subbands,
        });
        let snapshot = self.subarrays.with_subarray(name, |s| {
            s.attach(&subscription);
            s.snapshot(&subscription.subbands)
        });
        match snapshot {
            Some(snapshot) => {
                self.next_handle += 1;
                let handle = subscription.handle;
                client.subscriptions.push(subscription);
                debug!("{port} subscribed to '{name}' with handle {handle}");
                Message::CalSubscribeAck {
                    status: CalStatus::Success,
                    handle,
                    subarray: Some(snapshot),
                }
            }
            None => refuse(CalStatus::ErrNoSubarray),
        }
    }

    fn unsubscribe(&mut self, port: PortId, name: &str, handle: SubscriptionHandle) -> CalStatus {
        let client = match self.clients.get_mut(&port) {
            Some(c) => c,
            None => return CalStatus::ErrNoSubarray,
        };
        let before = client.subscriptions.len();
        client
            .subscriptions
            .retain(|s| !(s.handle == handle && s.subarray == name));
        if client.subscriptions.len() == before {
            return CalStatus::ErrNoSubarray;
        }
        // The subarray may already be gone; the subscription is dropped
        // regardless.
        self.subarrays.with_subarray(name, |s| s.detach(handle));
        debug!("{port} unsubscribed handle {handle} from '{name}'");
        CalStatus::Success
    }

    /// One pass of the pipeline: release dead ports, collect a finished
    /// background calibration, then swap, maintain, calibrate and publish.
    fn tick(&mut self, ctx: &mut dyn PortContext) -> TickReport {
        let mut report = TickReport {
            released_ports: self.dead_ports.len(),
            ..Default::default()
        };
        for port in self.dead_ports.drain(..) {
            ctx.close(port);
        }

        // A background calibration that has finished is published before
        // anything else can happen to the registry.
        if let Some(num_done) = self.cal_thread.as_mut().and_then(|t| t.poll()) {
            report.calibrated = num_done;
            report.updated = publish(&self.subarrays, ctx);
        }

        if let Err(reason) = self.accs.try_swap() {
            trace!("No ACC swap this tick: {reason}");
            return report;
        }
        report.swapped = true;
        report.removed = self.subarrays.undertaker();
        report.added = self.subarrays.creator();

        if let Some(dir) = &self.config.dump_dir {
            if let Some(front) = self.accs.lease_front() {
                match write_acc_dump(dir, &front) {
                    Ok(path) => debug!("Wrote {}", path.display()),
                    Err(e) => warn!("Couldn't write an ACC dump: {e}"),
                }
            }
        }

        match self.cal_thread.as_mut() {
            None => {
                let front = match self.accs.lease_front() {
                    Some(f) => f,
                    None => {
                        warn!("The front ACC is locked straight after a swap");
                        return report;
                    }
                };
                report.calibrated = self.subarrays.calibrate(self.calibrator.as_deref(), &front);
                drop(front);
                report.updated = publish(&self.subarrays, ctx);
            }

            Some(cal_thread) => {
                if cal_thread.is_busy() {
                    warn!("The calibration thread is still busy");
                } else if let Some(front) = self.accs.lease_front_owned() {
                    report.dispatched = cal_thread.submit(front);
                }
            }
        }

        trace!("{report:?}");
        report
    }
}

/// Send finished results to their subscribers.
fn publish(subarrays: &SubArrays, ctx: &mut dyn PortContext) -> usize {
    subarrays.update_all(&mut |subscription, gains| {
        ctx.send(
            subscription.port,
            Message::CalUpdate {
                name: subscription.subarray.clone(),
                handle: subscription.handle,
                timestamp: gains.timestamp(),
                status: CalStatus::Success,
                gains: GainsPayload::from_gains(gains, &subscription.subbands),
            },
        );
    })
}

impl EventHandler for CalServer {
    type Error = ServerError;

    fn handle(
        &mut self,
        event: Event,
        port: PortId,
        ctx: &mut dyn PortContext,
    ) -> Result<EventStatus, ServerError> {
        match self.state {
            ServerState::Initial { .. } => self.handle_initial(event, port, ctx),
            ServerState::Enabled { .. } => Ok(self.handle_enabled(event, port, ctx)),
        }
    }
}
