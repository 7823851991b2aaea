// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Antenna arrays (the parents of subarrays) and their configuration file.

mod error;
mod selection;

pub use error::{ArrayConfigError, SelectionError};
pub use selection::AntennaArraySelection;

use std::path::Path;

use indexmap::IndexMap;
use log::debug;
use ndarray::prelude::*;
use serde::Deserialize;

use crate::constants::NUM_POLS;

/// A named antenna array. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct AntennaArray {
    pub name: String,

    /// The geocentric position of the array's reference point \[metres\].
    pub location: [f64; 3],

    /// Antenna positions relative to `location`. The first dimension is
    /// antenna, the second is polarisation, the third is x, y, z
    /// \[metres\].
    pub positions: Array3<f64>,
}

impl AntennaArray {
    pub fn num_antennas(&self) -> usize {
        self.positions.len_of(Axis(0))
    }

    pub fn num_pols(&self) -> usize {
        self.positions.len_of(Axis(1))
    }

    /// The number of receiver channel units needed to observe every antenna
    /// and polarisation of this array.
    pub fn num_rcus(&self) -> usize {
        self.num_antennas() * self.num_pols()
    }
}

/// All of the antenna arrays known to the server, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AntennaArrays {
    arrays: IndexMap<String, AntennaArray>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ArraysFile {
    array: Vec<ArrayEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ArrayEntry {
    name: String,
    #[serde(default)]
    location: [f64; 3],
    positions: Vec<Vec<[f64; 3]>>,
}

impl AntennaArrays {
    pub fn read_file<T: AsRef<Path>>(file: T) -> Result<AntennaArrays, ArrayConfigError> {
        let file = file.as_ref();
        debug!("Reading antenna arrays from {}", file.display());
        let contents = std::fs::read_to_string(file)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(s: &str) -> Result<AntennaArrays, ArrayConfigError> {
        let ArraysFile { array: entries } = toml::from_str(s)?;
        if entries.is_empty() {
            return Err(ArrayConfigError::NoArrays);
        }

        let mut arrays = IndexMap::with_capacity(entries.len());
        for ArrayEntry {
            name,
            location,
            positions,
        } in entries
        {
            let array = array_from_positions(&name, location, positions)?;
            if arrays.insert(name.clone(), array).is_some() {
                return Err(ArrayConfigError::DuplicateName(name));
            }
        }

        Ok(AntennaArrays { arrays })
    }

    pub fn insert(&mut self, array: AntennaArray) -> Option<AntennaArray> {
        self.arrays.insert(array.name.clone(), array)
    }

    pub fn get(&self, name: &str) -> Option<&AntennaArray> {
        self.arrays.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AntennaArray> {
        self.arrays.values()
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

fn array_from_positions(
    name: &str,
    location: [f64; 3],
    positions: Vec<Vec<[f64; 3]>>,
) -> Result<AntennaArray, ArrayConfigError> {
    if positions.is_empty() {
        return Err(ArrayConfigError::NoAntennas(name.to_string()));
    }
    for (i_ant, pols) in positions.iter().enumerate() {
        if pols.len() != NUM_POLS {
            return Err(ArrayConfigError::PolCount {
                array: name.to_string(),
                antenna: i_ant,
                expected: NUM_POLS,
                got: pols.len(),
            });
        }
    }

    let num_antennas = positions.len();
    let flat = positions
        .into_iter()
        .flat_map(|pols| pols.into_iter().flatten())
        .collect::<Vec<f64>>();
    let positions = Array3::from_shape_vec((num_antennas, NUM_POLS, 3), flat)
        .expect("shape was validated above");

    Ok(AntennaArray {
        name: name.to_string(),
        location,
        positions,
    })
}
