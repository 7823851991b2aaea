// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Subarrays: named, independently calibrated subsets of a parent antenna
//! array, and the registry that owns them.

mod error;
mod gains;
mod registry;

pub use error::RegistryError;
pub use gains::{AntennaGains, GainsBuffer};
pub use registry::{Phase, SubArrays};

use std::sync::{Arc, Weak};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    acc::Acc,
    array::{AntennaArray, AntennaArraySelection, SelectionError},
    bitset::{RcuMask, SubbandSet},
    calibrate::{CalibrationError, Calibrator},
    dispatch::PortId,
    protocol::{GainsPayload, SubArraySnapshot},
};

/// The sampling set-up of a subarray's receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralWindow {
    /// \[Hz\]
    pub sampling_frequency: f64,
    pub nyquist_zone: u8,
    pub num_subbands: usize,
    /// The RCU control word applied to every selected RCU.
    pub rcu_control: u32,
}

impl SpectralWindow {
    /// The width of one subband \[Hz\].
    pub fn subband_width(&self) -> f64 {
        self.sampling_frequency / 2.0 / self.num_subbands as f64
    }

    /// The lower edge frequency of a subband \[Hz\].
    pub fn subband_freq(&self, subband: usize) -> f64 {
        f64::from(self.nyquist_zone.saturating_sub(1)) * self.sampling_frequency / 2.0
            + subband as f64 * self.subband_width()
    }
}

pub type SubscriptionHandle = u64;

/// A client's interest in the results of one subarray. The protocol handler
/// owns these; subarrays only hold weak references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub port: PortId,
    pub subarray: String,
    pub subbands: SubbandSet,
}

/// Everything about a subarray that stays fixed while it's calibrated.
#[derive(Debug, Clone, PartialEq)]
pub struct SubArrayLayout {
    pub name: String,
    pub parent: String,

    /// The parent's antenna positions (antenna, polarisation, xyz)
    /// \[metres\].
    pub positions: Array3<f64>,

    pub selection: AntennaArraySelection,
    pub spectral_window: SpectralWindow,
}

#[derive(Debug)]
pub struct SubArray {
    layout: SubArrayLayout,

    /// Indexed by [`GainsBuffer`].
    results: [AntennaGains; 2],

    subscriptions: Vec<Weak<Subscription>>,
}

impl SubArray {
    pub fn new(
        name: &str,
        parent: &AntennaArray,
        mask: &RcuMask,
        spectral_window: SpectralWindow,
    ) -> Result<SubArray, SelectionError> {
        let selection = AntennaArraySelection::new(parent, mask)?;
        let gains = AntennaGains::new(
            parent.num_antennas(),
            parent.num_pols(),
            spectral_window.num_subbands,
        );

        Ok(SubArray {
            layout: SubArrayLayout {
                name: name.to_string(),
                parent: parent.name.clone(),
                positions: parent.positions.clone(),
                selection,
                spectral_window,
            },
            results: [gains.clone(), gains],
            subscriptions: vec![],
        })
    }

    pub fn name(&self) -> &str {
        &self.layout.name
    }

    pub fn layout(&self) -> &SubArrayLayout {
        &self.layout
    }

    /// Run the calibration algorithm against `acc`, writing into the front
    /// result buffer. Without an algorithm nothing happens and `Ok(false)` is
    /// returned.
    pub fn calibrate(
        &mut self,
        calibrator: Option<&dyn Calibrator>,
        acc: &Acc,
    ) -> Result<bool, CalibrationError> {
        let calibrator = match calibrator {
            Some(c) => c,
            None => return Ok(false),
        };
        let front = &mut self.results[GainsBuffer::Front as usize];
        calibrator.calibrate(&self.layout, acc, front)?;
        front.set_timestamp(acc.timestamp());
        front.set_done(true);
        Ok(true)
    }

    pub fn is_done(&self) -> bool {
        self.results[GainsBuffer::Front as usize].is_done()
    }

    pub fn clear_done(&mut self) {
        self.results[GainsBuffer::Front as usize].set_done(false);
    }

    pub fn gains(&self, buffer: GainsBuffer) -> &AntennaGains {
        &self.results[buffer as usize]
    }

    /// Copy the front result into the back buffer, making it the last
    /// published result.
    pub(crate) fn publish(&mut self) {
        let [front, back] = &mut self.results;
        back.clone_from(front);
    }

    pub fn attach(&mut self, subscription: &Arc<Subscription>) {
        self.subscriptions.push(Arc::downgrade(subscription));
    }

    /// Returns whether a subscription with this handle was attached.
    pub fn detach(&mut self, handle: SubscriptionHandle) -> bool {
        let mut found = false;
        self.subscriptions.retain(|w| match w.upgrade() {
            Some(s) if s.handle == handle => {
                found = true;
                false
            }
            Some(_) => true,
            None => false,
        });
        found
    }

    /// The number of subscriptions still held by their owners.
    pub fn num_subscriptions(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Hand the front gains to every live subscriber. Subscriptions whose
    /// owners have gone are forgotten. Returns the number of subscribers
    /// notified.
    pub fn notify(&mut self, sink: &mut dyn FnMut(&Subscription, &AntennaGains)) -> usize {
        let front = &self.results[GainsBuffer::Front as usize];
        let mut num_notified = 0;
        self.subscriptions.retain(|w| match w.upgrade() {
            Some(subscription) => {
                sink(&subscription, front);
                num_notified += 1;
                true
            }
            None => false,
        });
        num_notified
    }

    /// Describe this subarray to a subscriber, including the last published
    /// gains restricted to their subbands.
    pub fn snapshot(&self, subbands: &SubbandSet) -> SubArraySnapshot {
        let back = &self.results[GainsBuffer::Back as usize];
        SubArraySnapshot {
            name: self.layout.name.clone(),
            parent: self.layout.parent.clone(),
            rcu_mask: self.layout.selection.mask().clone(),
            spectral_window: self.layout.spectral_window.clone(),
            num_antennas: self.layout.positions.len_of(Axis(0)),
            gains: back.is_done().then(|| GainsPayload::from_gains(back, subbands)),
        }
    }
}
