// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The prediffer: walk a work domain of a visibility store chunk by chunk
//! and assemble least-squares equations against a model.
//!
//! A work domain is a (frequency, time) rectangle. [`Prediffer::set_work_domain`]
//! works out which channels and time steps it covers, and each call of
//! [`Prediffer::next_data_chunk`] maps the next few of those time steps into
//! memory. Equations are assembled by [`Prediffer::fill_fitters`] with one
//! fitter per solve cell; baselines are shared out between worker threads,
//! each accumulating into its own fitters, and the workers' fitters are merged
//! into the caller's at the end.

mod error;
mod fitter;
mod model;
mod selection;
mod store;

pub use error::{FitterError, PredifferError, StoreError};
pub use fitter::Fitter;
pub use model::{Predictor, StationGainModel, StationPhasors};
pub(crate) use selection::CORRELATION_TYPES;
pub use selection::{select_baselines, select_correlations, select_stations, CorrelationType};
pub use store::{unpack_flags, Chunk, StoreMeta, VisStore};

use std::{collections::BTreeMap, ops::Range};

use log::{debug, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{c64, constants::DEFAULT_TIMES_PER_CHUNK};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredifferOptions {
    /// Glob patterns of station names. Empty means every station.
    pub station_patterns: Vec<String>,

    pub correlation_type: CorrelationType,

    /// Correlation names, e.g. `XX`. Empty means all of them.
    pub correlation_names: Vec<String>,

    /// The number of worker threads. Zero means one per core.
    pub num_threads: usize,

    pub times_per_chunk: usize,
}

impl Default for PredifferOptions {
    fn default() -> Self {
        PredifferOptions {
            station_patterns: vec![],
            correlation_type: CorrelationType::All,
            correlation_names: vec![],
            num_threads: 0,
            times_per_chunk: DEFAULT_TIMES_PER_CHUNK,
        }
    }
}

/// The part of the store a work domain covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDomain {
    /// Frequency-ordered channels.
    pub chans: Range<usize>,

    pub times: Range<usize>,
}

/// Maps work-domain channels (ascending frequency) to physical channels in
/// the store. Reading data and writing residuals both go through this so
/// they can't disagree about channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelMap {
    start: usize,
    reverse: bool,
}

impl ChannelMap {
    fn new(meta: &StoreMeta, chans: &Range<usize>) -> ChannelMap {
        ChannelMap {
            start: meta.physical_chan(chans.start),
            reverse: meta.reverse_chan,
        }
    }

    fn physical(self, chan: usize) -> usize {
        if self.reverse {
            self.start - chan
        } else {
            self.start + chan
        }
    }
}

/// How the work domain is divided into solve cells, each with its own
/// fitter. Cells are numbered time-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SolveGrid {
    chans_per_cell: usize,
    times_per_cell: usize,
    num_chan_cells: usize,
    num_time_cells: usize,
}

impl SolveGrid {
    fn new(domain: &WorkDomain, chans_per_cell: usize, times_per_cell: usize) -> SolveGrid {
        SolveGrid {
            chans_per_cell,
            times_per_cell,
            num_chan_cells: (domain.chans.len() + chans_per_cell - 1) / chans_per_cell,
            num_time_cells: (domain.times.len() + times_per_cell - 1) / times_per_cell,
        }
    }

    fn num_cells(&self) -> usize {
        self.num_chan_cells * self.num_time_cells
    }

    /// The cell of a work-domain time step and channel.
    fn cell(&self, time: usize, chan: usize) -> usize {
        (time / self.times_per_cell) * self.num_chan_cells + chan / self.chans_per_cell
    }
}

/// Per-worker buffers, allocated once and reused for every chunk.
#[derive(Default)]
struct Scratch {
    flags: Vec<bool>,
    partials: Vec<(usize, c64)>,
    fitters: Vec<Fitter>,
}

impl Scratch {
    /// Get ready to accumulate into `num_cells` fitters of `num_unknowns`.
    fn reset(&mut self, vis_per_time: usize, num_cells: usize, num_unknowns: usize) {
        self.flags.resize(vis_per_time, false);
        if self.fitters.len() == num_cells
            && self
                .fitters
                .first()
                .map(|f| f.num_unknowns() == num_unknowns)
                .unwrap_or(true)
        {
            self.fitters.iter_mut().for_each(Fitter::reset);
        } else {
            self.fitters = vec![Fitter::new(num_unknowns); num_cells];
        }
    }
}

pub struct Prediffer {
    store: VisStore,

    /// (station1, station2) -> row of the baseline in the store.
    baselines: BTreeMap<(usize, usize), usize>,

    corrs: Vec<usize>,
    times_per_chunk: usize,
    pool: rayon::ThreadPool,

    /// One per worker thread, indexed by worker.
    scratch: Vec<Scratch>,

    domain: Option<WorkDomain>,
    grid: Option<SolveGrid>,

    /// The next work-domain time step to map.
    cursor: usize,

    chunk: Option<Chunk>,
}

impl Prediffer {
    pub fn new(store: VisStore, options: &PredifferOptions) -> Result<Prediffer, PredifferError> {
        if options.times_per_chunk == 0 {
            return Err(PredifferError::TimesPerChunk);
        }
        let baselines = select_baselines(
            store.meta(),
            &options.station_patterns,
            options.correlation_type,
        )?;
        let corrs = select_correlations(store.meta(), &options.correlation_names)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_threads)
            .thread_name(|i| format!("prediffer-{i}"))
            .build()?;
        let num_workers = pool.current_num_threads();
        debug!("Prediffer using {num_workers} worker threads");

        Ok(Prediffer {
            store,
            baselines,
            corrs,
            times_per_chunk: options.times_per_chunk,
            pool,
            scratch: (0..num_workers).map(|_| Scratch::default()).collect(),
            domain: None,
            grid: None,
            cursor: 0,
            chunk: None,
        })
    }

    pub fn store(&self) -> &VisStore {
        &self.store
    }

    pub fn baselines(&self) -> &BTreeMap<(usize, usize), usize> {
        &self.baselines
    }

    pub fn correlations(&self) -> &[usize] {
        &self.corrs
    }

    pub fn num_threads(&self) -> usize {
        self.scratch.len()
    }

    pub fn work_domain(&self) -> Option<&WorkDomain> {
        self.domain.as_ref()
    }

    /// The store time steps of the mapped chunk.
    pub fn chunk_times(&self) -> Option<Range<usize>> {
        self.chunk.as_ref().map(Chunk::times)
    }

    pub fn num_solve_cells(&self) -> usize {
        self.grid.map(|g| g.num_cells()).unwrap_or(0)
    }

    /// One empty fitter per solve cell.
    pub fn new_fitters(&self, num_unknowns: usize) -> Vec<Fitter> {
        vec![Fitter::new(num_unknowns); self.num_solve_cells()]
    }

    /// Centre frequencies of the work domain's channels \[Hz\].
    pub fn domain_freqs(&self) -> Vec<f64> {
        let meta = self.store.meta();
        self.domain
            .as_ref()
            .map(|d| d.chans.clone().map(|c| meta.chan_centre(c)).collect())
            .unwrap_or_default()
    }

    /// Set the frequency \[Hz\] and time \[seconds\] rectangle to work on.
    /// Returns `false` if the rectangle doesn't overlap the store's data at
    /// all, in which case there is nothing to iterate over.
    ///
    /// The solve grid is reset to one cell per chunk's worth of time steps,
    /// spanning all channels.
    pub fn set_work_domain(
        &mut self,
        start_freq: f64,
        end_freq: f64,
        start_time: f64,
        end_time: f64,
    ) -> bool {
        self.chunk = None;
        self.domain = None;
        self.grid = None;

        let meta = self.store.meta();
        let chans = overlapping(meta.num_chan, |c| meta.chan_edges(c), start_freq, end_freq);
        let times = overlapping(meta.num_times(), |t| meta.time_edges(t), start_time, end_time);
        let (chans, times) = match (chans, times) {
            (Some(c), Some(t)) => (c, t),
            _ => {
                debug!(
                    "Work domain {start_freq}-{end_freq} Hz, {start_time}-{end_time} s has no data"
                );
                return false;
            }
        };
        debug!("Work domain covers channels {chans:?} and time steps {times:?}");

        self.cursor = times.start;
        let domain = WorkDomain { chans, times };
        self.grid = Some(SolveGrid::new(
            &domain,
            domain.chans.len(),
            self.times_per_chunk,
        ));
        self.domain = Some(domain);
        true
    }

    /// Divide the work domain into solve cells of the given size. Returns
    /// the number of cells.
    pub fn set_solve_grid(
        &mut self,
        chans_per_cell: usize,
        times_per_cell: usize,
    ) -> Result<usize, PredifferError> {
        if chans_per_cell == 0 || times_per_cell == 0 {
            return Err(PredifferError::BadSolveGrid);
        }
        let domain = self.domain.as_ref().ok_or(PredifferError::NoWorkDomain)?;
        let grid = SolveGrid::new(domain, chans_per_cell, times_per_cell);
        self.grid = Some(grid);
        Ok(grid.num_cells())
    }

    /// Map the next run of time steps. Returns `false` once the work domain
    /// is exhausted (or if there is no work domain).
    pub fn next_data_chunk(&mut self) -> Result<bool, PredifferError> {
        // Release the previous chunk's maps first.
        self.chunk = None;
        let end = match &self.domain {
            Some(d) => d.times.end,
            None => return Ok(false),
        };
        if self.cursor >= end {
            return Ok(false);
        }
        let times = self.cursor..end.min(self.cursor + self.times_per_chunk);
        trace!("Mapping time steps {times:?}");
        self.chunk = Some(self.store.map_chunk(times.clone())?);
        self.cursor = times.end;
        Ok(true)
    }

    /// Add an equation to the relevant cell's fitter for every unflagged,
    /// selected visibility of the mapped chunk.
    pub fn fill_fitters<P: Predictor>(
        &mut self,
        predictor: &P,
        fitters: &mut [Fitter],
    ) -> Result<(), PredifferError> {
        let Prediffer {
            store,
            baselines,
            corrs,
            pool,
            scratch,
            domain,
            grid,
            chunk,
            ..
        } = self;
        let chunk = chunk.as_ref().ok_or(PredifferError::NoChunk)?;
        let (domain, grid) = match (domain.as_ref(), grid) {
            (Some(d), Some(g)) => (d, *g),
            _ => return Err(PredifferError::NoWorkDomain),
        };
        if fitters.len() != grid.num_cells() {
            return Err(PredifferError::FitterCount {
                expected: grid.num_cells(),
                got: fitters.len(),
            });
        }
        let num_unknowns = predictor.num_parameters();
        if let Some(f) = fitters.iter().find(|f| f.num_unknowns() != num_unknowns) {
            return Err(FitterError::SizeMismatch {
                expected: num_unknowns,
                got: f.num_unknowns(),
            }
            .into());
        }

        let meta = store.meta();
        let freqs: Vec<f64> = domain.chans.clone().map(|c| meta.chan_centre(c)).collect();
        let precalc = predictor.precalculate(meta, &freqs);
        let chan_map = ChannelMap::new(meta, &domain.chans);
        let baselines: Vec<((usize, usize), usize)> =
            baselines.iter().map(|(&bl, &row)| (bl, row)).collect();
        let corrs = corrs.as_slice();
        let num_workers = scratch.len();
        let num_chans = domain.chans.len();
        let time_offset = chunk.times().start - domain.times.start;

        pool.install(|| {
            scratch
                .par_iter_mut()
                .enumerate()
                .for_each(|(worker, scratch)| {
                    scratch.reset(meta.vis_per_time(), grid.num_cells(), num_unknowns);
                    for t in 0..chunk.num_times() {
                        unpack_flags(chunk.flags_at(t), &mut scratch.flags);
                        let vis = chunk.vis_at(t);
                        let domain_time = time_offset + t;

                        for &(baseline, row) in baselines.iter().skip(worker).step_by(num_workers) {
                            for chan in 0..num_chans {
                                let phys = chan_map.physical(chan);
                                let cell = grid.cell(domain_time, chan);
                                for &corr in corrs {
                                    let i = meta.vis_index(row, phys, corr);
                                    if scratch.flags[i] {
                                        continue;
                                    }
                                    let [re, im] = vis[i];
                                    let data = c64::new(re.into(), im.into());
                                    scratch.partials.clear();
                                    let model = predictor.predict(
                                        &precalc,
                                        cell,
                                        baseline,
                                        chan,
                                        corr,
                                        &mut scratch.partials,
                                    );
                                    scratch.fitters[cell].add_complex_equation(
                                        &scratch.partials,
                                        data - model,
                                        1.0,
                                    );
                                }
                            }
                        }
                    }
                });
        });

        for worker in scratch.iter() {
            for (fitter, own) in fitters.iter_mut().zip(worker.fitters.iter()) {
                fitter.merge(own)?;
            }
        }
        Ok(())
    }

    /// Write `data - model` for every selected visibility of the mapped chunk
    /// into the residual column. Visibilities that aren't selected are left
    /// alone.
    pub fn compute_residuals<P: Predictor>(&mut self, predictor: &P) -> Result<(), PredifferError> {
        let Prediffer {
            store,
            baselines,
            corrs,
            pool,
            domain,
            grid,
            chunk,
            ..
        } = self;
        let chunk = chunk.as_mut().ok_or(PredifferError::NoChunk)?;
        let (domain, grid) = match (domain.as_ref(), grid) {
            (Some(d), Some(g)) => (d, *g),
            _ => return Err(PredifferError::NoWorkDomain),
        };

        let meta = store.meta();
        let freqs: Vec<f64> = domain.chans.clone().map(|c| meta.chan_centre(c)).collect();
        let precalc = predictor.precalculate(meta, &freqs);
        let chan_map = ChannelMap::new(meta, &domain.chans);
        let vis_per_time = chunk.vis_per_time();
        let time_offset = chunk.times().start - domain.times.start;
        let num_chans = domain.chans.len();
        let corrs = corrs.as_slice();
        let baselines = &*baselines;

        let (vis, residual) = chunk.vis_and_residual_mut();
        pool.install(|| {
            residual
                .par_chunks_mut(vis_per_time)
                .zip(vis.par_chunks(vis_per_time))
                .enumerate()
                .for_each(|(t, (residual, vis))| {
                    let domain_time = time_offset + t;
                    let mut partials = vec![];
                    for (&baseline, &row) in baselines {
                        for chan in 0..num_chans {
                            let phys = chan_map.physical(chan);
                            let cell = grid.cell(domain_time, chan);
                            for &corr in corrs {
                                let i = meta.vis_index(row, phys, corr);
                                partials.clear();
                                let model = predictor.predict(
                                    &precalc,
                                    cell,
                                    baseline,
                                    chan,
                                    corr,
                                    &mut partials,
                                );
                                let [re, im] = vis[i];
                                residual[i] = [re - model.re as f32, im - model.im as f32];
                            }
                        }
                    }
                });
        });
        chunk.flush()?;
        Ok(())
    }
}

/// The contiguous run of indices whose (lower, upper) edges overlap the open
/// interval (start, end). Edges must be ascending.
fn overlapping<F: Fn(usize) -> (f64, f64)>(
    n: usize,
    edges: F,
    start: f64,
    end: f64,
) -> Option<Range<usize>> {
    if start.is_nan() || end.is_nan() || start >= end {
        return None;
    }
    let first = (0..n).find(|&i| edges(i).1 > start)?;
    let last = (first..n).take_while(|&i| edges(i).0 < end).last()?;
    Some(first..last + 1)
}
