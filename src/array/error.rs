// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with antenna arrays.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArrayConfigError {
    #[error("The antenna arrays file doesn't define any arrays")]
    NoArrays,

    #[error("Antenna array '{0}' is defined more than once")]
    DuplicateName(String),

    #[error("Antenna array '{0}' has no antennas")]
    NoAntennas(String),

    #[error("Antenna {antenna} of array '{array}' has {got} polarisations; expected {expected}")]
    PolCount {
        array: String,
        antenna: usize,
        expected: usize,
        got: usize,
    },

    #[error("Couldn't parse the antenna arrays file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("The RCU mask doesn't select any antennas")]
    Empty,

    #[error("RCU {index} was selected, but the parent array only has {num_rcus} RCUs")]
    OutOfRange { index: usize, num_rcus: usize },
}
