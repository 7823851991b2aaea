// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::VecDeque, sync::atomic::Ordering};

use approx::assert_abs_diff_eq;
use tempfile::tempdir;

use super::*;
use crate::{
    array::tests::test_array,
    c64,
    protocol::RspStatus,
    acc::Acc,
    calibrate::CalibrationError,
    subarray::{
        tests::{test_subarray, CountingCalibrator},
        AntennaGains, Phase, SubArrayLayout,
    },
};

const NUM_SUBBANDS: usize = 4;
const NUM_RCUS: usize = 4;

/// Records everything the server asks of the outside world.
#[derive(Default)]
struct MockContext {
    sent: Vec<(PortId, Message)>,
    opened: Vec<PortId>,
    closed: Vec<PortId>,
    timers: Vec<(TimerId, Duration, Option<Duration>)>,
    cancelled: Vec<TimerId>,
    num_cancel_all: usize,
    waiting: VecDeque<PortId>,
}

impl MockContext {
    fn take_sent(&mut self) -> Vec<(PortId, Message)> {
        std::mem::take(&mut self.sent)
    }

    fn last_timer(&self) -> TimerId {
        self.timers.last().unwrap().0
    }
}

impl PortContext for MockContext {
    fn send(&mut self, port: PortId, message: Message) {
        self.sent.push((port, message));
    }

    fn open(&mut self, port: PortId) {
        self.opened.push(port);
    }

    fn close(&mut self, port: PortId) {
        self.closed.push(port);
    }

    fn set_timer(&mut self, _: PortId, delay: Duration, period: Option<Duration>) -> TimerId {
        let id = self.timers.len() as TimerId + 100;
        self.timers.push((id, delay, period));
        id
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.cancelled.push(timer);
    }

    fn cancel_all_timers(&mut self) {
        self.num_cancel_all += 1;
    }

    fn accept(&mut self) -> Option<PortId> {
        self.waiting.pop_front()
    }
}

fn config(mode: CalibrationMode) -> ServerConfig {
    ServerConfig {
        tick_period: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(10),
        reconnect_interval: Duration::from_secs(5),
        mode,
        dump_dir: None,
    }
}

fn new_server(config: ServerConfig, calibrator: Arc<dyn Calibrator>) -> CalServer {
    let mut arrays = AntennaArrays::default();
    arrays.insert(test_array("LBA", 2));
    // More antennas than the station has RCUs for.
    arrays.insert(test_array("BIG", 3));
    CalServer::new(
        config,
        arrays,
        Arc::new(AccBuffers::new(NUM_SUBBANDS, NUM_RCUS)),
        Some(calibrator),
    )
}

/// Wraps a server and its context with the usual chores.
struct Harness {
    server: CalServer,
    ctx: MockContext,
    calibrator: Arc<CountingCalibrator>,
}

impl Harness {
    fn new(mode: CalibrationMode) -> Harness {
        Harness::with_config(config(mode))
    }

    fn with_config(config: ServerConfig) -> Harness {
        let calibrator = Arc::new(CountingCalibrator::default());
        let server = new_server(config, calibrator.clone());
        Harness {
            server,
            ctx: MockContext::default(),
            calibrator,
        }
    }

    fn event(&mut self, port: PortId, event: Event) -> Result<EventStatus, ServerError> {
        self.server.handle(event, port, &mut self.ctx)
    }

    fn driver(&mut self, message: Message) -> Result<EventStatus, ServerError> {
        self.event(PortId::Driver, Event::Message(message))
    }

    fn request(&mut self, port: PortId, message: Message) -> Message {
        self.ctx.take_sent();
        assert_eq!(
            self.event(port, Event::Message(message)).unwrap(),
            EventStatus::Handled
        );
        self.ctx
            .take_sent()
            .into_iter()
            .find(|(p, _)| *p == port)
            .map(|(_, m)| m)
            .unwrap()
    }

    /// Run the whole driver handshake.
    fn enable(mut self) -> Harness {
        self.event(PortId::Local, Event::Entry).unwrap();
        self.event(PortId::Driver, Event::Connected).unwrap();
        self.driver(Message::RspGetconfigAck {
            n_rsp_boards: 1,
            n_rcus: NUM_RCUS as u32,
        })
        .unwrap();
        self.driver(Message::RspGetclockAck {
            clock_mhz: 200,
            status: RspStatus::Success,
        })
        .unwrap();
        self.driver(Message::RspSubclockAck {
            status: RspStatus::Success,
        })
        .unwrap();
        assert!(self.server.is_enabled());
        self.ctx.take_sent();
        self
    }

    fn tick_id(&self) -> TimerId {
        match self.server.state {
            ServerState::Enabled { tick } => tick,
            ServerState::Initial { .. } => panic!("server isn't enabled"),
        }
    }

    fn tick(&mut self) -> TickReport {
        let tick = self.tick_id();
        self.event(PortId::Local, Event::Timer(tick)).unwrap();
        self.server.last_tick()
    }

    fn connect_client(&mut self, n: u32) -> PortId {
        let port = PortId::Client(n);
        self.ctx.waiting.push_back(port);
        self.event(PortId::Acceptor, Event::AcceptRequest).unwrap();
        port
    }

    /// Have the producer side commit a new back ACC.
    fn fill_back(&self) {
        let mut back = self.server.accs().lease_back().unwrap();
        back.data_mut().fill(c64::new(1.0, 0.0));
        back.commit();
    }

    fn updates(&mut self) -> Vec<(PortId, String, u64)> {
        self.ctx
            .take_sent()
            .into_iter()
            .filter_map(|(port, m)| match m {
                Message::CalUpdate { name, handle, .. } => Some((port, name, handle)),
                _ => None,
            })
            .collect()
    }
}

fn cal_start(name: &str, rcus: &[usize]) -> Message {
    Message::CalStart {
        name: name.to_string(),
        parent: "LBA".to_string(),
        rcu_mask: rcus.iter().copied().collect(),
        nyquist_zone: 1,
        rcu_control: 0xb9,
    }
}

fn start_status(reply: Message) -> CalStatus {
    match reply {
        Message::CalStartAck { status, .. } => status,
        other => panic!("Expected CAL_STARTACK, got {}", other.name()),
    }
}

#[test]
fn test_handshake() {
    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    assert_eq!(h.ctx.opened, vec![PortId::Acceptor, PortId::Driver]);
    assert_eq!(h.server.handshake_stage(), Some(HandshakeStage::Connecting));

    h.event(PortId::Driver, Event::Connected).unwrap();
    assert_eq!(h.ctx.take_sent(), vec![(PortId::Driver, Message::RspGetconfig)]);
    assert_eq!(h.server.handshake_stage(), Some(HandshakeStage::AwaitConfig));
    let config_deadline = h.ctx.last_timer();

    h.driver(Message::RspGetconfigAck {
        n_rsp_boards: 1,
        n_rcus: 4,
    })
    .unwrap();
    assert_eq!(
        h.ctx.take_sent(),
        vec![(PortId::Driver, Message::RspGetclock { cache: false })]
    );
    assert!(h.ctx.cancelled.contains(&config_deadline));
    assert_eq!(
        h.server.hardware(),
        Some(Hardware {
            n_rsp_boards: 1,
            n_rcus: 4
        })
    );

    h.driver(Message::RspGetclockAck {
        clock_mhz: 160,
        status: RspStatus::Success,
    })
    .unwrap();
    assert_eq!(
        h.ctx.take_sent(),
        vec![(
            PortId::Driver,
            Message::RspSubclock {
                period: CLOCK_SUBSCRIPTION_PERIOD
            }
        )]
    );
    assert_eq!(h.server.clock_mhz(), 160);
    assert!(!h.server.is_enabled());

    h.driver(Message::RspSubclockAck {
        status: RspStatus::Success,
    })
    .unwrap();
    assert!(h.server.is_enabled());
    let (_, delay, period) = *h.ctx.timers.last().unwrap();
    assert_eq!(delay, Duration::from_secs(1));
    assert_eq!(period, Some(Duration::from_secs(1)));
}

#[test]
fn test_handshake_failures_are_fatal() {
    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    h.event(PortId::Driver, Event::Connected).unwrap();
    h.driver(Message::RspGetconfigAck {
        n_rsp_boards: 1,
        n_rcus: 4,
    })
    .unwrap();
    let result = h.driver(Message::RspGetclockAck {
        clock_mhz: 200,
        status: RspStatus::Failure,
    });
    assert_eq!(
        result,
        Err(ServerError::HandshakeRefused {
            request: "RSP_GETCLOCK"
        })
    );

    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    h.event(PortId::Driver, Event::Connected).unwrap();
    let result = h.driver(Message::RspGetconfigAck {
        n_rsp_boards: 1,
        n_rcus: 96,
    });
    assert_eq!(
        result,
        Err(ServerError::RcuCount {
            expected: 4,
            got: 96
        })
    );

    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    h.event(PortId::Driver, Event::Connected).unwrap();
    h.driver(Message::RspGetconfigAck {
        n_rsp_boards: 1,
        n_rcus: 4,
    })
    .unwrap();
    h.driver(Message::RspGetclockAck {
        clock_mhz: 200,
        status: RspStatus::Success,
    })
    .unwrap();
    let result = h.driver(Message::RspSubclockAck {
        status: RspStatus::Failure,
    });
    assert!(matches!(result, Err(ServerError::HandshakeRefused { .. })));
    assert!(!h.server.is_enabled());
}

#[test]
fn test_handshake_timeout_is_fatal() {
    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    h.event(PortId::Driver, Event::Connected).unwrap();
    let deadline = h.ctx.last_timer();
    let result = h.event(PortId::Local, Event::Timer(deadline));
    assert_eq!(
        result,
        Err(ServerError::HandshakeTimeout {
            request: "RSP_GETCONFIG",
            timeout: Duration::from_secs(10)
        })
    );
}

#[test]
fn test_unsupported_clock_is_fatal() {
    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    h.event(PortId::Driver, Event::Connected).unwrap();
    h.driver(Message::RspGetconfigAck {
        n_rsp_boards: 1,
        n_rcus: 4,
    })
    .unwrap();
    let result = h.driver(Message::RspGetclockAck {
        clock_mhz: 123,
        status: RspStatus::Success,
    });
    assert_eq!(result, Err(ServerError::Clock(123)));
}

#[test]
fn test_driver_unreachable_retries() {
    let mut h = Harness::new(CalibrationMode::Inline);
    h.event(PortId::Local, Event::Entry).unwrap();
    h.event(PortId::Driver, Event::Disconnected).unwrap();
    let (reconnect, delay, period) = *h.ctx.timers.last().unwrap();
    assert_eq!(delay, Duration::from_secs(5));
    assert!(period.is_none());

    h.event(PortId::Local, Event::Timer(reconnect)).unwrap();
    assert_eq!(
        h.ctx.opened,
        vec![PortId::Acceptor, PortId::Driver, PortId::Driver]
    );
    assert_eq!(h.server.handshake_stage(), Some(HandshakeStage::Connecting));
}

#[test]
fn test_driver_loss_returns_to_initial() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    h.ctx.opened.clear();
    h.event(PortId::Driver, Event::Disconnected).unwrap();
    assert!(!h.server.is_enabled());
    assert_eq!(h.ctx.num_cancel_all, 1);
    assert_eq!(h.ctx.opened, vec![PortId::Driver]);
    assert!(h.server.hardware().is_none());

    // A full handshake is needed again.
    h.event(PortId::Driver, Event::Connected).unwrap();
    assert_eq!(h.ctx.take_sent(), vec![(PortId::Driver, Message::RspGetconfig)]);
}

#[test]
fn test_clients_waiting_during_handshake_are_accepted() {
    let mut h = Harness::new(CalibrationMode::Inline);
    h.ctx.waiting.push_back(PortId::Client(0));
    h.event(PortId::Local, Event::Entry).unwrap();
    assert_eq!(
        h.event(PortId::Acceptor, Event::AcceptRequest).unwrap(),
        EventStatus::NotHandled
    );
    let h = h.enable();
    assert_eq!(h.server.num_clients(), 1);
}

#[test]
fn test_started_subarray_goes_live_after_swap() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);

    h.ctx.take_sent();
    h.event(client, Event::Message(cal_start("S1", &[0, 1, 2, 3])))
        .unwrap();
    let sent = h.ctx.take_sent();
    assert!(sent.contains(&(
        client,
        Message::CalStartAck {
            name: "S1".to_string(),
            status: CalStatus::Success
        }
    )));
    // The RCUs are set up on the driver.
    assert!(sent.contains(&(
        PortId::Driver,
        Message::RspSetrcu {
            rcu_mask: [0, 1, 2, 3].into_iter().collect(),
            control: 0xb9
        }
    )));
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::PendingAdd));

    h.fill_back();
    let report = h.tick();
    assert!(report.swapped);
    assert_eq!(report.added, 1);
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::Live));
}

#[test]
fn test_empty_rcu_mask_is_refused() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    let reply = h.request(client, cal_start("S1", &[]));
    assert_eq!(start_status(reply), CalStatus::ErrRange);
    assert!(h.server.subarrays().is_empty());
    assert!(!h
        .ctx
        .sent
        .iter()
        .any(|(_, m)| matches!(m, Message::RspSetrcu { .. })));
}

#[test]
fn test_duplicate_name_is_refused() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    assert_eq!(
        start_status(h.request(client, cal_start("S1", &[0, 1]))),
        CalStatus::Success
    );
    assert_ne!(
        start_status(h.request(client, cal_start("S1", &[2, 3]))),
        CalStatus::Success
    );
    assert_eq!(h.server.subarrays().len(), 1);

    // Still refused once live.
    h.fill_back();
    h.tick();
    assert_ne!(
        start_status(h.request(client, cal_start("S1", &[0]))),
        CalStatus::Success
    );
    assert_eq!(h.server.subarrays().len(), 1);
}

#[test]
fn test_start_validation() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);

    let mut unknown_parent = cal_start("S1", &[0]);
    if let Message::CalStart { parent, .. } = &mut unknown_parent {
        *parent = "HBA".to_string();
    }
    assert_eq!(
        start_status(h.request(client, unknown_parent)),
        CalStatus::ErrNoParent
    );

    // RCU 4 doesn't exist on a two-antenna array.
    assert_eq!(
        start_status(h.request(client, cal_start("S1", &[1, 4]))),
        CalStatus::ErrRange
    );

    let mut bad_zone = cal_start("S1", &[0]);
    if let Message::CalStart { nyquist_zone, .. } = &mut bad_zone {
        *nyquist_zone = 0;
    }
    assert_eq!(start_status(h.request(client, bad_zone)), CalStatus::ErrRange);
    assert!(h.server.subarrays().is_empty());
}

#[test]
fn test_start_beyond_station_rcus_is_refused() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);

    let big = |rcus: &[usize]| {
        let mut start = cal_start("S1", rcus);
        if let Message::CalStart { parent, .. } = &mut start {
            *parent = "BIG".to_string();
        }
        start
    };
    // "BIG" has 6 RCUs but the station only has 4.
    h.ctx.take_sent();
    h.event(client, Event::Message(big(&[0, 5]))).unwrap();
    let sent = h.ctx.take_sent();
    assert_eq!(
        sent,
        vec![(
            client,
            Message::CalStartAck {
                name: "S1".to_string(),
                status: CalStatus::ErrRange
            }
        )]
    );
    assert_eq!(h.server.subarrays().phase("S1"), None);
    assert!(h.server.subarrays().is_empty());

    // RCUs the station does have are fine.
    assert_eq!(
        start_status(h.request(client, big(&[0, NUM_RCUS - 1]))),
        CalStatus::Success
    );
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::PendingAdd));
}

#[test]
fn test_stop() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0, 1]));

    let reply = h.request(
        client,
        Message::CalStop {
            name: "S1".to_string(),
        },
    );
    assert_eq!(
        reply,
        Message::CalStopAck {
            name: "S1".to_string(),
            status: CalStatus::Success
        }
    );
    // It was never live, so it's gone straight away.
    assert!(h.server.subarrays().is_empty());

    let reply = h.request(
        client,
        Message::CalStop {
            name: "S1".to_string(),
        },
    );
    assert_eq!(
        reply,
        Message::CalStopAck {
            name: "S1".to_string(),
            status: CalStatus::ErrNoSubarray
        }
    );
}

/// A removal requested after a pass isn't carried out until the next swap's
/// maintenance, and the subarray isn't calibrated in between.
#[test]
fn test_stopped_subarray_is_removed_after_swap() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0, 1, 2, 3]));

    // Tick 1: swap, S1 goes live and is calibrated.
    h.fill_back();
    let report = h.tick();
    assert!(report.swapped);
    assert_eq!(report.calibrated, 1);
    assert_eq!(h.calibrator.calls.load(Ordering::SeqCst), 1);

    // Tick 2: the stop arrives, but there's no new ACC; S1 is only scheduled.
    h.request(
        client,
        Message::CalStop {
            name: "S1".to_string(),
        },
    );
    let report = h.tick();
    assert!(!report.swapped);
    assert_eq!(report.removed, 0);
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::PendingRemove));

    // Tick 3: the undertaker frees it before calibration.
    h.fill_back();
    let report = h.tick();
    assert!(report.swapped);
    assert_eq!(report.removed, 1);
    assert_eq!(report.calibrated, 0);
    assert!(h.server.subarrays().phase("S1").is_none());
    assert_eq!(h.calibrator.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_no_swap_no_pipeline() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0]));

    // The back hasn't been filled.
    let report = h.tick();
    assert_eq!(report, TickReport::default());
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::PendingAdd));
    assert_eq!(h.server.accs().num_swaps(), 0);
}

fn subscribe(h: &mut Harness, port: PortId, name: &str, subbands: &[usize]) -> (CalStatus, u64) {
    match h.request(
        port,
        Message::CalSubscribe {
            name: name.to_string(),
            subbands: subbands.iter().copied().collect(),
        },
    ) {
        Message::CalSubscribeAck { status, handle, .. } => (status, handle),
        other => panic!("Expected CAL_SUBSCRIBEACK, got {}", other.name()),
    }
}

#[test]
fn test_subscribe_and_unsubscribe() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let owner = h.connect_client(0);
    let watcher = h.connect_client(1);
    h.request(owner, cal_start("S1", &[0, 1, 2, 3]));

    assert_eq!(
        subscribe(&mut h, watcher, "S2", &[0]),
        (CalStatus::ErrNoSubarray, 0)
    );
    assert_eq!(
        subscribe(&mut h, watcher, "S1", &[NUM_SUBBANDS]),
        (CalStatus::ErrRange, 0)
    );
    // Subscribing works before the subarray is live.
    let (status, handle) = subscribe(&mut h, watcher, "S1", &[1, 3]);
    assert_eq!(status, CalStatus::Success);
    assert_eq!(handle, 1);

    h.fill_back();
    h.tick();
    assert_eq!(h.updates(), vec![(watcher, "S1".to_string(), handle)]);

    let reply = h.request(
        watcher,
        Message::CalUnsubscribe {
            name: "S1".to_string(),
            handle,
        },
    );
    assert_eq!(
        reply,
        Message::CalUnsubscribeAck {
            name: "S1".to_string(),
            handle,
            status: CalStatus::Success
        }
    );
    let reply = h.request(
        watcher,
        Message::CalUnsubscribe {
            name: "S1".to_string(),
            handle,
        },
    );
    assert!(matches!(
        reply,
        Message::CalUnsubscribeAck {
            status: CalStatus::ErrNoSubarray,
            ..
        }
    ));

    h.fill_back();
    h.tick();
    assert!(h.updates().is_empty());
}

#[test]
fn test_update_carries_requested_subbands() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0, 3]));
    let (_, handle) = subscribe(&mut h, client, "S1", &[2]);

    h.fill_back();
    h.tick();
    let update = h
        .ctx
        .take_sent()
        .into_iter()
        .find_map(|(_, m)| match m {
            Message::CalUpdate {
                handle: hd,
                gains,
                timestamp,
                ..
            } if hd == handle => Some((gains, timestamp)),
            _ => None,
        })
        .unwrap();
    let (gains, timestamp) = update;
    assert_eq!(gains.subbands, vec![2]);
    assert_eq!(gains.gains.len(), 2 * 2);
    assert_abs_diff_eq!(gains.gains[0].re, 1.0);
    assert!(timestamp.is_none());

    // New subscribers see the published result in their snapshot.
    match h.request(
        client,
        Message::CalSubscribe {
            name: "S1".to_string(),
            subbands: [0].into_iter().collect(),
        },
    ) {
        Message::CalSubscribeAck {
            subarray: Some(snapshot),
            ..
        } => {
            assert!(snapshot.gains.is_some());
            assert_abs_diff_eq!(snapshot.spectral_window.sampling_frequency, 200e6);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// Every completed calibration is published exactly once.
#[test]
fn test_notify_once_per_calibration() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0, 1]));
    subscribe(&mut h, client, "S1", &[0]);

    h.fill_back();
    assert_eq!(h.tick().updated, 1);
    assert_eq!(h.updates().len(), 1);

    for _ in 0..3 {
        assert_eq!(h.tick().updated, 0);
        assert!(h.updates().is_empty());
    }

    h.fill_back();
    assert_eq!(h.tick().updated, 1);
    assert_eq!(h.updates().len(), 1);
    assert_eq!(h.calibrator.calls.load(Ordering::SeqCst), 2);
}

/// Within one tick, additions happen before calibration and removals before
/// calibration, and results go out in the same tick.
#[test]
fn test_tick_ordering() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("old", &[0]));
    h.fill_back();
    h.tick();
    h.ctx.take_sent();

    h.request(client, cal_start("new", &[1]));
    subscribe(&mut h, client, "new", &[0]);
    h.request(
        client,
        Message::CalStop {
            name: "old".to_string(),
        },
    );
    let calls_before = h.calibrator.calls.load(Ordering::SeqCst);

    h.fill_back();
    let report = h.tick();
    assert_eq!(report.removed, 1);
    assert_eq!(report.added, 1);
    // Only "new" was calibrated; "old" was already freed.
    assert_eq!(report.calibrated, 1);
    assert_eq!(h.calibrator.calls.load(Ordering::SeqCst), calls_before + 1);
    assert_eq!(report.updated, 1);
    let updates = h.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, "new");
}

#[test]
fn test_client_disconnect_tears_down() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    let other = h.connect_client(1);
    h.request(client, cal_start("S1", &[0, 1]));
    h.request(other, cal_start("S2", &[2, 3]));
    h.fill_back();
    h.tick();

    h.event(client, Event::Disconnected).unwrap();
    assert_eq!(h.server.num_clients(), 1);
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::PendingRemove));
    assert_eq!(h.server.subarrays().phase("S2"), Some(Phase::Live));
    // The port isn't closed from inside its own event.
    assert!(h.ctx.closed.is_empty());

    // Ports are released on the next tick even without a swap.
    let report = h.tick();
    assert!(!report.swapped);
    assert_eq!(report.released_ports, 1);
    assert_eq!(h.ctx.closed, vec![client]);

    h.fill_back();
    assert_eq!(h.tick().removed, 1);
    assert!(h.server.subarrays().phase("S1").is_none());
}

#[test]
fn test_clock_update() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    h.driver(Message::RspUpdclock { clock_mhz: 160 }).unwrap();
    assert_eq!(h.server.clock_mhz(), 160);
    h.driver(Message::RspUpdclock { clock_mhz: 7 }).unwrap();
    assert_eq!(h.server.clock_mhz(), 160);

    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0]));
    let sampling_frequency = h
        .server
        .subarrays()
        .with_subarray("S1", |s| s.layout().spectral_window.sampling_frequency)
        .unwrap();
    assert_abs_diff_eq!(sampling_frequency, 160e6);
}

#[test]
fn test_acc_dumps() {
    let dir = tempdir().unwrap();
    let mut config = config(CalibrationMode::Inline);
    config.dump_dir = Some(dir.path().to_path_buf());
    let mut h = Harness::with_config(config).enable();

    h.fill_back();
    h.tick();
    let dumps = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(dumps, 1);
}

#[test]
fn test_threaded_calibration() {
    let mut h = Harness::new(CalibrationMode::Thread).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0, 1, 2, 3]));
    subscribe(&mut h, client, "S1", &[0]);

    h.fill_back();
    let report = h.tick();
    assert!(report.swapped);
    assert!(report.dispatched);
    assert_eq!(report.updated, 0);

    assert!(h.server.wait_for_calibration(Duration::from_secs(10)));
    // Results go out on the next tick, before any new swap.
    h.fill_back();
    let report = h.tick();
    assert_eq!(report.calibrated, 1);
    assert_eq!(report.updated, 1);
    assert!(report.swapped);
    assert_eq!(h.updates().len(), 1);
    assert!(h.server.wait_for_calibration(Duration::from_secs(10)));
}

struct PanickingCalibrator;

impl Calibrator for PanickingCalibrator {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn calibrate(
        &self,
        _: &SubArrayLayout,
        _: &Acc,
        _: &mut AntennaGains,
    ) -> Result<(), CalibrationError> {
        panic!("calibration went wrong");
    }
}

#[test]
fn test_cal_thread_worker_panic_is_reported() {
    let subarrays = Arc::new(SubArrays::new());
    subarrays.schedule_add(test_subarray("S1")).unwrap();
    subarrays.creator();
    let accs = Arc::new(AccBuffers::new(2, 4));

    let mut worker = CalThread::spawn(subarrays, Some(Arc::new(PanickingCalibrator)));
    assert!(worker.submit(accs.lease_front_owned().unwrap()));
    // The worker dies without reporting back.
    assert!(!worker.wait(Duration::from_secs(10)));
    assert!(!worker.shutdown());
    // Unwinding released the front.
    assert!(!accs.is_front_locked());
    // Joining twice is harmless.
    assert!(worker.shutdown());
}

/// While the worker holds the front ACC, no swap can happen and a removed
/// subarray stays allocated.
#[test]
fn test_threaded_removal_waits_for_worker() {
    let mut h = Harness::new(CalibrationMode::Thread).enable();
    let client = h.connect_client(0);
    h.request(client, cal_start("S1", &[0, 1]));

    // Lock the front ourselves to stand in for a long calibration.
    h.fill_back();
    h.tick();
    assert!(h.server.wait_for_calibration(Duration::from_secs(10)));
    let accs = Arc::clone(h.server.accs());
    let front = accs.lease_front().unwrap();

    h.request(
        client,
        Message::CalStop {
            name: "S1".to_string(),
        },
    );
    h.fill_back();
    let report = h.tick();
    assert!(!report.swapped);
    assert_eq!(h.server.subarrays().phase("S1"), Some(Phase::PendingRemove));

    drop(front);
    let report = h.tick();
    assert!(report.swapped);
    assert_eq!(report.removed, 1);
    assert!(h.server.subarrays().is_empty());
}

#[test]
fn test_unexpected_client_message() {
    let mut h = Harness::new(CalibrationMode::Inline).enable();
    let client = h.connect_client(0);
    assert_eq!(
        h.event(client, Event::Message(Message::RspGetconfig)).unwrap(),
        EventStatus::NotHandled
    );
}
