// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod tests;

use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use super::common::{display_warnings, InfoPrinter, Warn, ARG_FILE_HELP};
use crate::{
    constants::{DEFAULT_DAMPING, DEFAULT_ITERATIONS, DEFAULT_TIMES_PER_CHUNK},
    params::PrediffParams,
    prediffer::{CorrelationType, PredifferOptions, CORRELATION_TYPES},
    CalServerError,
};

lazy_static::lazy_static! {
    static ref CORRELATION_TYPE_HELP: String =
        format!("Which baselines to use. Supported: {}. Default: {}", *CORRELATION_TYPES, CorrelationType::default());

    static ref TIMES_PER_CHUNK_HELP: String =
        format!("The number of time steps mapped into memory at once. Default: {DEFAULT_TIMES_PER_CHUNK}");

    static ref ITERATIONS_HELP: String =
        format!("The number of solve iterations per chunk. Default: {DEFAULT_ITERATIONS}");

    static ref DAMPING_HELP: String =
        format!("The relative damping added to the normal equations' diagonal. Default: {DEFAULT_DAMPING:e}");
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct PrediffArgs {
    #[clap(name = "ARGUMENTS_FILE", help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    pub(super) args_file: Option<PathBuf>,

    /// The directory of the visibility store.
    #[clap(short, long, parse(from_os_str), help_heading = "INPUT DATA")]
    pub(super) store: Option<PathBuf>,

    /// Glob patterns of the stations to use, e.g. "CS*". Default: all
    /// stations.
    #[clap(long, multiple_values(true), help_heading = "SELECTION")]
    pub(super) stations: Option<Vec<String>>,

    #[clap(long, help = CORRELATION_TYPE_HELP.as_str(), help_heading = "SELECTION")]
    pub(super) correlation_type: Option<String>,

    /// The correlations to use, e.g. "XX YY". Default: all correlations.
    #[clap(long, multiple_values(true), help_heading = "SELECTION")]
    pub(super) correlations: Option<Vec<String>>,

    /// The lowest frequency in the work domain [Hz].
    #[clap(long, help_heading = "WORK DOMAIN", allow_hyphen_values = true)]
    pub(super) start_freq: Option<f64>,

    /// The highest frequency in the work domain [Hz].
    #[clap(long, help_heading = "WORK DOMAIN", allow_hyphen_values = true)]
    pub(super) end_freq: Option<f64>,

    /// The earliest time in the work domain [seconds].
    #[clap(long, help_heading = "WORK DOMAIN", allow_hyphen_values = true)]
    pub(super) start_time: Option<f64>,

    /// The latest time in the work domain [seconds].
    #[clap(long, help_heading = "WORK DOMAIN", allow_hyphen_values = true)]
    pub(super) end_time: Option<f64>,

    #[clap(long, help = TIMES_PER_CHUNK_HELP.as_str(), help_heading = "WORK DOMAIN")]
    pub(super) times_per_chunk: Option<usize>,

    /// The number of channels in each solve cell. Default: all of them.
    #[clap(long, help_heading = "SOLVING")]
    pub(super) chans_per_cell: Option<usize>,

    /// The number of time steps in each solve cell. Default: the chunk size.
    #[clap(long, help_heading = "SOLVING")]
    pub(super) times_per_cell: Option<usize>,

    #[clap(long, help = ITERATIONS_HELP.as_str(), help_heading = "SOLVING")]
    pub(super) iterations: Option<usize>,

    #[clap(long, help = DAMPING_HELP.as_str(), help_heading = "SOLVING")]
    pub(super) damping: Option<f64>,

    /// The number of worker threads. Default: one per core.
    #[clap(short = 'j', long, help_heading = "SOLVING")]
    pub(super) num_threads: Option<usize>,

    /// The flux density of the calibrator source [Jy]. Default: 1.
    #[clap(long, help_heading = "MODEL")]
    pub(super) flux: Option<f64>,

    /// The direction of the calibrator source as an ITRF unit vector.
    /// Default: 0 0 1.
    #[clap(long, multiple_values(true), number_of_values = 3, allow_hyphen_values = true, help_heading = "MODEL")]
    pub(super) direction: Option<Vec<f64>>,

    /// Write data minus the fitted model into the store's residual file.
    #[clap(long, help_heading = "OUTPUT")]
    #[serde(default)]
    pub(super) write_residuals: bool,
}

impl PrediffArgs {
    /// Consolidate the CLI arguments with those in the argument file, if any.
    /// CLI parameters win.
    pub(super) fn merge(self) -> Result<PrediffArgs, CalServerError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;

        if let Some(arg_file) = cli_args.args_file {
            let PrediffArgs {
                args_file: _,
                store,
                stations,
                correlation_type,
                correlations,
                start_freq,
                end_freq,
                start_time,
                end_time,
                times_per_chunk,
                chans_per_cell,
                times_per_cell,
                iterations,
                damping,
                num_threads,
                flux,
                direction,
                write_residuals,
            } = unpack_arg_file!(arg_file);

            Ok(PrediffArgs {
                args_file: None,
                store: cli_args.store.or(store),
                stations: cli_args.stations.or(stations),
                correlation_type: cli_args.correlation_type.or(correlation_type),
                correlations: cli_args.correlations.or(correlations),
                start_freq: cli_args.start_freq.or(start_freq),
                end_freq: cli_args.end_freq.or(end_freq),
                start_time: cli_args.start_time.or(start_time),
                end_time: cli_args.end_time.or(end_time),
                times_per_chunk: cli_args.times_per_chunk.or(times_per_chunk),
                chans_per_cell: cli_args.chans_per_cell.or(chans_per_cell),
                times_per_cell: cli_args.times_per_cell.or(times_per_cell),
                iterations: cli_args.iterations.or(iterations),
                damping: cli_args.damping.or(damping),
                num_threads: cli_args.num_threads.or(num_threads),
                flux: cli_args.flux.or(flux),
                direction: cli_args.direction.or(direction),
                write_residuals: cli_args.write_residuals || write_residuals,
            })
        } else {
            Ok(cli_args)
        }
    }

    pub(super) fn parse(self) -> Result<PrediffParams, CalServerError> {
        debug!("{:#?}", self);

        let PrediffArgs {
            args_file: _,
            store,
            stations,
            correlation_type,
            correlations,
            start_freq,
            end_freq,
            start_time,
            end_time,
            times_per_chunk,
            chans_per_cell,
            times_per_cell,
            iterations,
            damping,
            num_threads,
            flux,
            direction,
            write_residuals,
        } = self;

        let store_dir = store.ok_or(PrediffArgsError::NoStore)?;

        let correlation_type = match correlation_type {
            Some(c) => CorrelationType::from_str(&c)
                .map_err(|_| PrediffArgsError::CorrelationType(c))?,
            None => CorrelationType::default(),
        };

        let times_per_chunk = times_per_chunk.unwrap_or(DEFAULT_TIMES_PER_CHUNK);
        for (value, what) in [
            (Some(times_per_chunk), "time steps per chunk"),
            (chans_per_cell, "channels per cell"),
            (times_per_cell, "time steps per cell"),
            (iterations, "iterations"),
        ] {
            if value == Some(0) {
                return Err(PrediffArgsError::ZeroSize(what).into());
            }
        }
        if let Some(t) = times_per_cell {
            if t > times_per_chunk {
                format!("{t} time steps per cell is more than the {times_per_chunk} per chunk; cells will be cut at chunk boundaries").warn();
            }
        }

        let damping = damping.unwrap_or(DEFAULT_DAMPING);
        if !damping.is_finite() || damping < 0.0 {
            return Err(PrediffArgsError::Damping(damping).into());
        }

        let direction = match direction.as_deref() {
            None => [0.0, 0.0, 1.0],
            Some([x, y, z]) => [*x, *y, *z],
            Some(d) => return Err(PrediffArgsError::Direction(d.len()).into()),
        };
        if direction.iter().all(|d| *d == 0.0) {
            return Err(PrediffArgsError::ZeroDirection.into());
        }

        let stations = stations.unwrap_or_default();
        let correlations = correlations.unwrap_or_default();
        let freq_range = (
            start_freq.unwrap_or(f64::NEG_INFINITY),
            end_freq.unwrap_or(f64::INFINITY),
        );
        let time_range = (
            start_time.unwrap_or(f64::NEG_INFINITY),
            end_time.unwrap_or(f64::INFINITY),
        );
        let iterations = iterations.unwrap_or(DEFAULT_ITERATIONS);
        let flux = flux.unwrap_or(1.0);

        let mut printer = InfoPrinter::new("Prediffer set up".into());
        printer.push_line(format!("Visibility store: {}", store_dir.display()).into());
        printer.push_block(vec![
            if stations.is_empty() {
                "Stations: all".into()
            } else {
                format!("Stations: {}", stations.join(" ")).into()
            },
            format!("Correlation type: {correlation_type}").into(),
            if correlations.is_empty() {
                "Correlations: all".into()
            } else {
                format!("Correlations: {}", correlations.join(" ")).into()
            },
        ]);
        printer.push_block(vec![
            format!("Frequencies: {} to {} Hz", freq_range.0, freq_range.1).into(),
            format!("Times: {} to {} s", time_range.0, time_range.1).into(),
            format!("{times_per_chunk} time steps per chunk").into(),
        ]);
        printer.push_block(vec![
            format!("{iterations} iterations with damping {damping:e}").into(),
            format!(
                "Model: {flux} Jy towards [{}, {}, {}]",
                direction[0], direction[1], direction[2]
            )
            .into(),
        ]);
        if write_residuals {
            printer.push_line("Writing residuals".into());
        }
        printer.display();
        display_warnings();

        Ok(PrediffParams {
            store_dir,
            options: PredifferOptions {
                station_patterns: stations,
                correlation_type,
                correlation_names: correlations,
                num_threads: num_threads.unwrap_or(0),
                times_per_chunk,
            },
            freq_range,
            time_range,
            chans_per_cell,
            times_per_cell,
            iterations,
            damping,
            write_residuals,
            flux,
            direction,
        })
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), CalServerError> {
        debug!("Converting arguments into parameters");
        trace!("{:#?}", self);
        let params = self.parse()?;

        if dry_run {
            info!("Dry run -- exiting now.");
            return Ok(());
        }

        params.run()?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub(super) enum PrediffArgsError {
    #[error("No visibility store was specified")]
    NoStore,

    #[error("'{0}' isn't a correlation type; supported: {}", *CORRELATION_TYPES)]
    CorrelationType(String),

    #[error("The source direction needs 3 components; got {0}")]
    Direction(usize),

    #[error("The source direction can't be the zero vector")]
    ZeroDirection,

    #[error("The number of {0} must be at least 1")]
    ZeroSize(&'static str),

    #[error("The damping must be a non-negative number; got {0}")]
    Damping(f64),
}
