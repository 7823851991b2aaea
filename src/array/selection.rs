// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Selecting a subset of a parent array's antennas and polarisations.

use ndarray::prelude::*;

use super::{AntennaArray, SelectionError};
use crate::bitset::RcuMask;

/// The selection matrix and RCU index mapping of a subarray.
///
/// Bit `num_pols * antenna + pol` of the requesting RCU mask selects that
/// antenna's polarisation. Every selected (antenna, polarisation) pair maps
/// to the hardware RCU observing it; unselected pairs map to -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntennaArraySelection {
    /// The first dimension is antenna, the second is polarisation.
    select: Array2<bool>,

    /// Same shape as `select`.
    rcu_index: Array2<i32>,

    mask: RcuMask,
}

impl AntennaArraySelection {
    pub fn new(
        parent: &AntennaArray,
        mask: &RcuMask,
    ) -> Result<AntennaArraySelection, SelectionError> {
        let num_antennas = parent.num_antennas();
        let num_pols = parent.num_pols();
        let num_rcus = num_antennas * num_pols;

        if mask.is_empty() {
            return Err(SelectionError::Empty);
        }
        if let Some(index) = mask.max().filter(|&max| max >= num_rcus) {
            return Err(SelectionError::OutOfRange { index, num_rcus });
        }

        let mut select = Array2::from_elem((num_antennas, num_pols), false);
        let mut rcu_index = Array2::from_elem((num_antennas, num_pols), -1);
        for rcu in mask.iter() {
            let (i_ant, i_pol) = (rcu / num_pols, rcu % num_pols);
            select[(i_ant, i_pol)] = true;
            rcu_index[(i_ant, i_pol)] = rcu as i32;
        }

        Ok(AntennaArraySelection {
            select,
            rcu_index,
            mask: mask.clone(),
        })
    }

    pub fn select(&self) -> ArrayView2<bool> {
        self.select.view()
    }

    pub fn rcu_index(&self) -> ArrayView2<i32> {
        self.rcu_index.view()
    }

    /// The RCU observing this antenna and polarisation, if it's selected.
    pub fn rcu(&self, antenna: usize, pol: usize) -> Option<usize> {
        self.rcu_index
            .get((antenna, pol))
            .copied()
            .filter(|&i| i >= 0)
            .map(|i| i as usize)
    }

    pub fn mask(&self) -> &RcuMask {
        &self.mask
    }

    pub fn num_selected(&self) -> usize {
        self.mask.count()
    }

    /// The antennas that have at least one polarisation selected.
    pub fn selected_antennas(&self) -> Vec<usize> {
        self.select
            .outer_iter()
            .enumerate()
            .filter(|(_, pols)| pols.iter().any(|&s| s))
            .map(|(i, _)| i)
            .collect()
    }

    /// Iterate over (antenna, polarisation, RCU) for every selected pair.
    pub fn iter_selected(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.rcu_index
            .indexed_iter()
            .filter(|(_, &rcu)| rcu >= 0)
            .map(|((i_ant, i_pol), &rcu)| (i_ant, i_pol, rcu as usize))
    }
}
