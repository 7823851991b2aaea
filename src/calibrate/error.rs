// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("Subarray selects RCU {rcu}, but the ACC only has {num_rcus} RCUs")]
    RcuOutOfRange { rcu: usize, num_rcus: usize },

    #[error("The ACC has {acc} subbands, but the gains have {gains}")]
    SubbandCount { acc: usize, gains: usize },

    #[error("Gains have {got} antennas, but the subarray's parent has {expected}")]
    AntennaCount { expected: usize, got: usize },
}
