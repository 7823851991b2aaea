// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Events exchanged with calibration clients (CAL) and with the station
//! hardware driver (RSP).
//!
//! On the wire, each event is one JSON object per line, tagged by its
//! `event` field, e.g. `{"event":"CAL_STOP","name":"S1"}`.

mod cal;
mod rsp;

pub use cal::{CalStatus, GainsPayload, SubArraySnapshot};
pub use rsp::RspStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitset::{RcuMask, SubbandSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // CAL requests and their acknowledgements.
    CalStart {
        name: String,
        parent: String,
        rcu_mask: RcuMask,
        nyquist_zone: u8,
        rcu_control: u32,
    },
    #[serde(rename = "CAL_STARTACK")]
    CalStartAck { name: String, status: CalStatus },

    CalStop { name: String },
    #[serde(rename = "CAL_STOPACK")]
    CalStopAck { name: String, status: CalStatus },

    CalSubscribe { name: String, subbands: SubbandSet },
    #[serde(rename = "CAL_SUBSCRIBEACK")]
    CalSubscribeAck {
        status: CalStatus,
        handle: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subarray: Option<SubArraySnapshot>,
    },

    CalUnsubscribe { name: String, handle: u64 },
    #[serde(rename = "CAL_UNSUBSCRIBEACK")]
    CalUnsubscribeAck {
        name: String,
        handle: u64,
        status: CalStatus,
    },

    /// Unsolicited; sent to subscribers whenever new gains are published.
    CalUpdate {
        name: String,
        handle: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        status: CalStatus,
        gains: GainsPayload,
    },

    // RSP driver requests and their acknowledgements.
    RspGetconfig,
    #[serde(rename = "RSP_GETCONFIGACK")]
    RspGetconfigAck { n_rsp_boards: u32, n_rcus: u32 },

    RspGetclock { cache: bool },
    #[serde(rename = "RSP_GETCLOCKACK")]
    RspGetclockAck { clock_mhz: u32, status: RspStatus },

    RspSubclock { period: u32 },
    #[serde(rename = "RSP_SUBCLOCKACK")]
    RspSubclockAck { status: RspStatus },

    /// Unsolicited, after a successful clock subscription.
    RspUpdclock { clock_mhz: u32 },

    RspSetrcu { rcu_mask: RcuMask, control: u32 },
    #[serde(rename = "RSP_SETRCUACK")]
    RspSetrcuAck { status: RspStatus },
}

impl Message {
    /// The event's name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Message::CalStart { .. } => "CAL_START",
            Message::CalStartAck { .. } => "CAL_STARTACK",
            Message::CalStop { .. } => "CAL_STOP",
            Message::CalStopAck { .. } => "CAL_STOPACK",
            Message::CalSubscribe { .. } => "CAL_SUBSCRIBE",
            Message::CalSubscribeAck { .. } => "CAL_SUBSCRIBEACK",
            Message::CalUnsubscribe { .. } => "CAL_UNSUBSCRIBE",
            Message::CalUnsubscribeAck { .. } => "CAL_UNSUBSCRIBEACK",
            Message::CalUpdate { .. } => "CAL_UPDATE",
            Message::RspGetconfig => "RSP_GETCONFIG",
            Message::RspGetconfigAck { .. } => "RSP_GETCONFIGACK",
            Message::RspGetclock { .. } => "RSP_GETCLOCK",
            Message::RspGetclockAck { .. } => "RSP_GETCLOCKACK",
            Message::RspSubclock { .. } => "RSP_SUBCLOCK",
            Message::RspSubclockAck { .. } => "RSP_SUBCLOCKACK",
            Message::RspUpdclock { .. } => "RSP_UPDCLOCK",
            Message::RspSetrcu { .. } => "RSP_SETRCU",
            Message::RspSetrcuAck { .. } => "RSP_SETRCUACK",
        }
    }

    /// Render as a single line of JSON, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Message, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
