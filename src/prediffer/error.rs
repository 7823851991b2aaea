// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from the prediffer and the visibility store it reads.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store file '{file}' has {got} bytes, but the metadata needs {expected} bytes")]
    FileSize {
        file: String,
        expected: u64,
        got: u64,
    },

    #[error("Data given to the store has shape {got:?}, but the metadata needs {expected:?}")]
    Shape {
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error("Baseline {index} refers to station {station}, but there are only {num_stations} stations")]
    BadBaseline {
        index: usize,
        station: usize,
        num_stations: usize,
    },

    #[error("The store has {num_stations} stations but {num_positions} station positions")]
    PositionCount {
        num_stations: usize,
        num_positions: usize,
    },

    #[error("The store's channel width must be positive and finite; got {0}")]
    ChannelWidth(f64),

    #[error("Time steps {0} out of range for a store with {1} time steps")]
    TimeRange(String, usize),

    #[error("Memory-mapped store data is misaligned: {0:?}")]
    Misaligned(bytemuck::PodCastError),

    #[error("Couldn't parse the store metadata: {0}")]
    Meta(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitterError {
    #[error("Fitter has {got} unknowns, but {expected} were expected")]
    SizeMismatch { expected: usize, got: usize },

    #[error("Normal matrix isn't positive definite (pivot {index} is {pivot}); try more damping")]
    NotPositiveDefinite { index: usize, pivot: f64 },
}

#[derive(Error, Debug)]
pub enum PredifferError {
    #[error("No stations match the patterns {0:?}")]
    NoStations(Vec<String>),

    #[error("No baselines are left after station and correlation type selection")]
    NoBaselines,

    #[error("Correlation '{name}' isn't in the store; available: {available}")]
    UnknownCorrelation { name: String, available: String },

    #[error("A work domain must be set first")]
    NoWorkDomain,

    #[error("No data chunk is mapped; call next_data_chunk first")]
    NoChunk,

    #[error("Solve cells must be at least one channel and one time step big")]
    BadSolveGrid,

    #[error("Got {got} fitters, but the solve grid has {expected} cells")]
    FitterCount { expected: usize, got: usize },

    #[error("Times per chunk must be at least 1")]
    TimesPerChunk,

    #[error("Bad station pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Fitter(#[from] FitterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
