// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Payloads exchanged with calibration clients.

use serde::{Deserialize, Serialize};

use crate::{
    bitset::{RcuMask, SubbandSet},
    c64,
    subarray::{AntennaGains, SpectralWindow},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalStatus {
    Success,

    /// The requested parent array isn't known.
    ErrNoParent,

    /// A request parameter is out of range, or the name is taken.
    ErrRange,

    /// The named subarray doesn't exist.
    ErrNoSubarray,
}

/// Gains restricted to a subscriber's subbands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainsPayload {
    pub num_antennas: usize,
    pub num_pols: usize,
    pub subbands: Vec<usize>,

    /// (antenna, polarisation, subband) order, over `subbands` only.
    pub gains: Vec<c64>,

    /// Same layout as `gains`.
    pub quality: Vec<f64>,
}

impl GainsPayload {
    /// Subbands beyond what the gains cover are left out.
    pub fn from_gains(gains: &AntennaGains, subbands: &SubbandSet) -> GainsPayload {
        let (num_antennas, num_pols, num_subbands) = gains.dim();
        let subbands = subbands
            .iter()
            .filter(|&sb| sb < num_subbands)
            .collect::<Vec<_>>();
        let g = gains.gains();
        let q = gains.quality();
        let mut out_gains = Vec::with_capacity(num_antennas * num_pols * subbands.len());
        let mut out_quality = Vec::with_capacity(out_gains.capacity());
        for i_ant in 0..num_antennas {
            for i_pol in 0..num_pols {
                for &sb in &subbands {
                    out_gains.push(g[(i_ant, i_pol, sb)]);
                    out_quality.push(q[(i_ant, i_pol, sb)]);
                }
            }
        }

        GainsPayload {
            num_antennas,
            num_pols,
            subbands,
            gains: out_gains,
            quality: out_quality,
        }
    }
}

/// What a subscriber is told about the subarray it subscribed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubArraySnapshot {
    pub name: String,
    pub parent: String,
    pub rcu_mask: RcuMask,
    pub spectral_window: SpectralWindow,
    pub num_antennas: usize,

    /// The last published gains, if any have been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gains: Option<GainsPayload>,
}
