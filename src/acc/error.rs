// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Why the ACC slots couldn't trade places. None of these are errors in the
/// usual sense; the caller just tries again later.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapRefused {
    #[error("the front ACC is in use")]
    FrontLocked,

    #[error("the back ACC is in use")]
    BackLocked,

    #[error("the back ACC hasn't been filled")]
    BackNotValid,
}

#[derive(Error, Debug)]
pub enum AccError {
    #[error("ACC has shape {got:?}, but {expected:?} was expected")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("'{0}' isn't a valid ACC dump file name; expected YYYYMMDD_HHMMSS_acc_<n>x<n>x<n>.dat")]
    BadFilename(String),

    #[error("ACC dump '{file}' has {got} bytes, but its dimensions need {expected} bytes")]
    PayloadSize {
        file: String,
        expected: u64,
        got: u64,
    },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
