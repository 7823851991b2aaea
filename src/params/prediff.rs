// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};

use crate::{
    prediffer::{
        Prediffer, PredifferError, PredifferOptions, Predictor, StationGainModel, VisStore,
    },
    PROGRESS_BARS,
};

#[derive(Debug)]
pub(crate) struct PrediffParams {
    pub(crate) store_dir: PathBuf,
    pub(crate) options: PredifferOptions,

    /// \[Hz\]
    pub(crate) freq_range: (f64, f64),

    /// \[seconds\]
    pub(crate) time_range: (f64, f64),

    /// If neither is set, each chunk is a single solve cell.
    pub(crate) chans_per_cell: Option<usize>,
    pub(crate) times_per_cell: Option<usize>,

    /// Solve iterations per chunk.
    pub(crate) iterations: usize,
    pub(crate) damping: f64,
    pub(crate) write_residuals: bool,

    /// The point-source model \[Jy\] and its direction.
    pub(crate) flux: f64,
    pub(crate) direction: [f64; 3],
}

impl PrediffParams {
    /// Returns the fitted gain model, or `None` if the work domain has no
    /// data.
    pub(crate) fn run(self) -> Result<Option<StationGainModel>, PredifferError> {
        let store = VisStore::open(&self.store_dir)?;
        let num_stations = store.meta().num_stations();
        let mut prediffer = Prediffer::new(store, &self.options)?;

        let (start_freq, end_freq) = self.freq_range;
        let (start_time, end_time) = self.time_range;
        if !prediffer.set_work_domain(start_freq, end_freq, start_time, end_time) {
            warn!("The work domain doesn't overlap any data; nothing to do");
            return Ok(None);
        }
        let (num_chans, num_times) = match prediffer.work_domain() {
            Some(d) => (d.chans.len(), d.times.len()),
            None => return Ok(None),
        };
        if self.chans_per_cell.is_some() || self.times_per_cell.is_some() {
            prediffer.set_solve_grid(
                self.chans_per_cell.unwrap_or(num_chans),
                self.times_per_cell
                    .unwrap_or(self.options.times_per_chunk),
            )?;
        }
        let num_cells = prediffer.num_solve_cells();
        info!(
            "Work domain: {num_chans} channels, {num_times} time steps, {} baselines, {num_cells} solve cells",
            prediffer.baselines().len()
        );

        let mut model =
            StationGainModel::new(num_stations, num_cells, self.flux, self.direction);
        let num_chunks = (num_times + self.options.times_per_chunk - 1) / self.options.times_per_chunk;
        let progress = make_progress_bar(num_chunks);

        while prediffer.next_data_chunk()? {
            for iteration in 0..self.iterations {
                let mut fitters = prediffer.new_fitters(model.num_parameters());
                prediffer.fill_fitters(&model, &mut fitters)?;

                let mut largest_step: f64 = 0.0;
                for (cell, fitter) in fitters.iter().enumerate() {
                    if fitter.num_equations() == 0 {
                        continue;
                    }
                    let delta = fitter.solve(self.damping)?;
                    largest_step = delta.iter().fold(largest_step, |acc, d| acc.max(d.abs()));
                    model.update(cell, delta.view());
                }
                debug!(
                    "Chunk {:?}, iteration {}: largest step {largest_step:e}",
                    prediffer.chunk_times(),
                    iteration + 1
                );
            }
            if self.write_residuals {
                prediffer.compute_residuals(&model)?;
            }
            progress.inc(1);
        }
        progress.abandon_with_message("Finished");

        for cell in 0..num_cells {
            let gains = (0..num_stations)
                .map(|s| {
                    let g = model.gain(cell, s);
                    format!("{:.4}@{:.4}", g.norm(), g.arg())
                })
                .collect::<Vec<_>>()
                .join(" ");
            info!("Cell {cell}: {gains}");
        }
        if self.write_residuals {
            info!(
                "Wrote residuals into {}",
                prediffer.store().dir().join("residual.dat").display()
            );
        }
        Ok(Some(model))
    }
}

fn make_progress_bar(num_chunks: usize) -> ProgressBar {
    ProgressBar::with_draw_target(
        Some(num_chunks as _),
        if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg}: [{wide_bar:.blue}] {pos:3}/{len:3} chunks ({elapsed_precise}<{eta_precise})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    )
    .with_position(0)
    .with_message("Prediffing")
}
