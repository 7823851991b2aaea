// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Calibration algorithms.
//!
//! The server doesn't care how gains are derived; it only needs something
//! implementing [`Calibrator`]. Without one, subarrays are never marked done
//! and so no updates are ever published.

mod error;
#[cfg(test)]
mod tests;

pub use error::CalibrationError;

use std::sync::Arc;

use itertools::Itertools;
use log::trace;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    acc::Acc,
    c64,
    subarray::{AntennaGains, SubArrayLayout},
};

lazy_static::lazy_static! {
    pub(crate) static ref CALIBRATION_ALGORITHMS: String = CalibrationAlgorithm::iter().join(", ");
}

/// Derives per-antenna gains for a subarray from an ACC.
pub trait Calibrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write gains and qualities for every antenna of `layout`'s parent into
    /// `gains`. Unselected antennas get zero gain and zero quality.
    fn calibrate(
        &self,
        layout: &SubArrayLayout,
        acc: &Acc,
        gains: &mut AntennaGains,
    ) -> Result<(), CalibrationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
pub enum CalibrationAlgorithm {
    /// Normalise each RCU's auto-correlation power against the subarray mean.
    #[strum(serialize = "autocorr")]
    AutoCorrelation,

    /// Don't calibrate.
    #[strum(serialize = "none")]
    None,
}

impl CalibrationAlgorithm {
    pub fn calibrator(self) -> Option<Arc<dyn Calibrator>> {
        match self {
            CalibrationAlgorithm::AutoCorrelation => Some(Arc::new(AutoCorrelationCalibrator)),
            CalibrationAlgorithm::None => None,
        }
    }
}

/// Gains from auto-correlation power alone.
///
/// For each subband, the gain of a selected RCU is the square root of its
/// auto-correlation power divided by the mean power of all selected RCUs with
/// positive power. RCUs without power get zero gain and zero quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoCorrelationCalibrator;

impl Calibrator for AutoCorrelationCalibrator {
    fn name(&self) -> &'static str {
        "autocorr"
    }

    fn calibrate(
        &self,
        layout: &SubArrayLayout,
        acc: &Acc,
        gains: &mut AntennaGains,
    ) -> Result<(), CalibrationError> {
        let (num_antennas, _, num_subbands) = gains.dim();
        if num_subbands != acc.num_subbands() {
            return Err(CalibrationError::SubbandCount {
                acc: acc.num_subbands(),
                gains: num_subbands,
            });
        }
        let expected = layout.selection.select().nrows();
        if num_antennas != expected {
            return Err(CalibrationError::AntennaCount {
                expected,
                got: num_antennas,
            });
        }
        let num_rcus = acc.num_rcus();
        let selected = layout.selection.iter_selected().collect::<Vec<_>>();
        if let Some(&(_, _, rcu)) = selected.iter().find(|(_, _, rcu)| *rcu >= num_rcus) {
            return Err(CalibrationError::RcuOutOfRange { rcu, num_rcus });
        }

        gains.gains_mut().fill(c64::default());
        gains.quality_mut().fill(0.0);
        let data = acc.data();
        for i_sb in 0..num_subbands {
            let (sum, count) = selected
                .iter()
                .map(|&(_, _, rcu)| data[(i_sb, rcu, rcu)].re)
                .filter(|p| *p > 0.0)
                .fold((0.0, 0_usize), |(s, c), p| (s + p, c + 1));
            if count == 0 {
                trace!("Subband {i_sb} of '{}' has no power", layout.name);
                continue;
            }
            let mean = sum / count as f64;

            for &(i_ant, i_pol, rcu) in &selected {
                let power = data[(i_sb, rcu, rcu)].re;
                if power > 0.0 {
                    gains.gains_mut()[(i_ant, i_pol, i_sb)] = c64::new((power / mean).sqrt(), 0.0);
                    gains.quality_mut()[(i_ant, i_pol, i_sb)] = 1.0;
                }
            }
        }

        Ok(())
    }
}
