// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Visibility models that the prediffer differences the data against.

use std::f64::consts::TAU;

use ndarray::prelude::*;

use super::StoreMeta;
use crate::{c64, constants::VEL_C};

/// Something that predicts visibilities and their partial derivatives with
/// respect to a set of real parameters. Each solve cell has its own copy of
/// the parameters.
pub trait Predictor: Sync {
    /// Sub-expressions shared by every baseline, computed once per chunk
    /// before the worker threads start.
    type Precalc: Sync;

    /// The number of parameters per solve cell.
    fn num_parameters(&self) -> usize;

    /// `freqs` are the centres of the work domain's channels \[Hz\].
    fn precalculate(&self, meta: &StoreMeta, freqs: &[f64]) -> Self::Precalc;

    /// Predict one visibility of `baseline` (a pair of station indices) at
    /// work-domain channel `chan` and store correlation `corr`. Nonzero
    /// partial derivatives are appended to `partials`.
    fn predict(
        &self,
        precalc: &Self::Precalc,
        cell: usize,
        baseline: (usize, usize),
        chan: usize,
        corr: usize,
        partials: &mut Vec<(usize, c64)>,
    ) -> c64;
}

/// An unpolarised point source seen through a complex gain per station.
/// Station `s` has amplitude parameter `2 s` and phase parameter `2 s + 1`.
///
/// For a parallel-hand correlation the model of baseline (p, q) is
/// `S g_p conj(g_q) exp(-2 pi i f (tau_p - tau_q))`, where `tau` is the
/// geometric delay of a station towards the source. Cross-hand correlations
/// are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct StationGainModel {
    /// Source flux density \[Jy\].
    flux: f64,

    /// Unit vector towards the source in the station position frame.
    direction: [f64; 3],

    /// (cell, parameter)
    params: Array2<f64>,
}

pub struct StationPhasors {
    /// (station, work-domain channel)
    geometric: Array2<c64>,

    /// Is each store correlation a parallel hand (XX, YY, ...)?
    parallel: Vec<bool>,
}

impl StationGainModel {
    /// All gains start at unity.
    pub fn new(num_stations: usize, num_cells: usize, flux: f64, direction: [f64; 3]) -> Self {
        let norm = direction.iter().map(|d| d * d).sum::<f64>().sqrt();
        let direction = if norm > 0.0 {
            direction.map(|d| d / norm)
        } else {
            direction
        };
        let mut params = Array2::zeros((num_cells, 2 * num_stations));
        params.slice_mut(s![.., ..;2]).fill(1.0);
        StationGainModel {
            flux,
            direction,
            params,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.params.len_of(Axis(0))
    }

    pub fn num_stations(&self) -> usize {
        self.params.len_of(Axis(1)) / 2
    }

    pub fn params(&self) -> ArrayView2<f64> {
        self.params.view()
    }

    pub fn gain(&self, cell: usize, station: usize) -> c64 {
        c64::from_polar(
            self.params[(cell, 2 * station)],
            self.params[(cell, 2 * station + 1)],
        )
    }

    pub fn set_gain(&mut self, cell: usize, station: usize, amplitude: f64, phase: f64) {
        self.params[(cell, 2 * station)] = amplitude;
        self.params[(cell, 2 * station + 1)] = phase;
    }

    /// Add a solved correction to a cell's parameters.
    pub fn update(&mut self, cell: usize, delta: ArrayView1<f64>) {
        let mut params = self.params.row_mut(cell);
        params += &delta;
    }
}

impl Predictor for StationGainModel {
    type Precalc = StationPhasors;

    fn num_parameters(&self) -> usize {
        self.params.len_of(Axis(1))
    }

    fn precalculate(&self, meta: &StoreMeta, freqs: &[f64]) -> StationPhasors {
        let mut geometric = Array2::zeros((meta.num_stations(), freqs.len()));
        for (mut row, pos) in geometric.outer_iter_mut().zip(meta.positions.iter()) {
            let delay = pos
                .iter()
                .zip(self.direction.iter())
                .map(|(p, d)| p * d)
                .sum::<f64>()
                / VEL_C;
            for (g, &freq) in row.iter_mut().zip(freqs) {
                *g = c64::from_polar(1.0, -TAU * freq * delay);
            }
        }
        let parallel = meta
            .corr_names
            .iter()
            .map(|name| {
                let b = name.as_bytes();
                b.len() == 2 && b[0].eq_ignore_ascii_case(&b[1])
            })
            .collect();
        StationPhasors {
            geometric,
            parallel,
        }
    }

    fn predict(
        &self,
        precalc: &StationPhasors,
        cell: usize,
        (p, q): (usize, usize),
        chan: usize,
        corr: usize,
        partials: &mut Vec<(usize, c64)>,
    ) -> c64 {
        if !precalc.parallel[corr] {
            return c64::default();
        }
        let geo = precalc.geometric[(p, chan)] * precalc.geometric[(q, chan)].conj();
        let gp = self.gain(cell, p);
        let gq = self.gain(cell, q);
        let phase_p = c64::from_polar(1.0, self.params[(cell, 2 * p + 1)]);
        let phase_q = c64::from_polar(1.0, self.params[(cell, 2 * q + 1)]);
        let vis = self.flux * gp * gq.conj() * geo;

        partials.push((2 * p, self.flux * phase_p * gq.conj() * geo));
        partials.push((2 * p + 1, c64::i() * vis));
        partials.push((2 * q, self.flux * gp * phase_q.conj() * geo));
        partials.push((2 * q + 1, -c64::i() * vis));
        vis
    }
}
