// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Station calibration server and prediffer for the LOFAR radio telescope.
//!
//! The calibration server receives array correlation cubes (ACCs) from an
//! acquisition side through a double buffer, calibrates any number of
//! client-requested subarrays against the front buffer once per tick and
//! publishes the resulting antenna gains to subscribers. The prediffer is an
//! independent, data-parallel pipeline that assembles least-squares equations
//! from a chunked visibility store.

pub mod acc;
pub mod array;
pub mod bitset;
pub mod calibrate;
mod cli;
pub mod constants;
pub mod dispatch;
pub(crate) mod params;
pub mod prediffer;
pub mod protocol;
pub mod server;
pub mod subarray;

// Re-exports.
pub use acc::{Acc, AccBuffers, SwapRefused};
pub use array::{AntennaArray, AntennaArraySelection, AntennaArrays};
pub use bitset::{BitSet, RcuMask, SubbandSet};
pub use calibrate::{AutoCorrelationCalibrator, Calibrator};
pub use cli::{CalServerCli, CalServerError};
pub use prediffer::{Fitter, Prediffer, VisStore};
pub use server::CalServer;
pub use subarray::{SubArray, SubArrays};

use crossbeam_utils::atomic::AtomicCell;

/// Should progress bars be drawn? Only the binary turns this on.
pub(crate) static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);

#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex64;
#[allow(non_camel_case_types)]
pub type c32 = num_complex::Complex32;
