// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use ndarray::prelude::*;

use crate::c64;

/// Which of a subarray's two result buffers. The front buffer is written by
/// calibration; the back buffer holds the last result handed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainsBuffer {
    Front = 0,
    Back = 1,
}

impl TryFrom<usize> for GainsBuffer {
    type Error = usize;

    fn try_from(index: usize) -> Result<GainsBuffer, usize> {
        match index {
            0 => Ok(GainsBuffer::Front),
            1 => Ok(GainsBuffer::Back),
            _ => Err(index),
        }
    }
}

/// Per-antenna complex gains and their quality, for every subband.
#[derive(Debug, Clone, PartialEq)]
pub struct AntennaGains {
    /// (antenna, polarisation, subband)
    gains: Array3<c64>,

    /// (antenna, polarisation, subband), between 0 (unusable) and 1.
    quality: Array3<f64>,

    done: bool,
    timestamp: Option<DateTime<Utc>>,
}

impl AntennaGains {
    pub fn new(num_antennas: usize, num_pols: usize, num_subbands: usize) -> AntennaGains {
        let dim = (num_antennas, num_pols, num_subbands);
        AntennaGains {
            gains: Array3::zeros(dim),
            quality: Array3::zeros(dim),
            done: false,
            timestamp: None,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.gains.dim()
    }

    pub fn gains(&self) -> ArrayView3<c64> {
        self.gains.view()
    }

    pub fn gains_mut(&mut self) -> ArrayViewMut3<c64> {
        self.gains.view_mut()
    }

    pub fn quality(&self) -> ArrayView3<f64> {
        self.quality.view()
    }

    pub fn quality_mut(&mut self) -> ArrayViewMut3<f64> {
        self.quality.view_mut()
    }

    /// Does this buffer hold a complete result?
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self, done: bool) {
        self.done = done;
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Option<DateTime<Utc>>) {
        self.timestamp = timestamp;
    }
}
