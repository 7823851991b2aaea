// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all calserver-related errors. This should be the *only*
//! error enum that is publicly visible.

use thiserror::Error;

use super::{prediff::PrediffArgsError, serve::ServeArgsError};
use crate::{
    acc::AccError,
    array::ArrayConfigError,
    params::ServeError,
    prediffer::{PredifferError, StoreError},
    server::ServerError,
};

/// The *only* publicly visible error from the `calserver` binary.
#[derive(Error, Debug)]
pub enum CalServerError {
    /// An error related to serving calibration clients.
    #[error("{0}")]
    Serve(String),

    /// The station driver handshake failed.
    #[error("{0}\n\nCheck that the RSP driver address is right and that the driver is running.")]
    Handshake(String),

    /// An error related to the antenna arrays file.
    #[error("{0}\n\nThe antenna arrays file is TOML with one [[array]] table per array.")]
    AntennaArrays(String),

    /// An error related to ACCs or ACC dump files.
    #[error("{0}")]
    Acc(String),

    /// An error related to the prediffer.
    #[error("{0}")]
    Prediffer(String),

    /// An error related to reading or writing a visibility store.
    #[error("{0}")]
    Store(String),

    /// An error related to argument files.
    #[error("{0}")]
    ArgFile(String),

    /// A generic error that can't be clarified further, e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<ServeArgsError> for CalServerError {
    fn from(e: ServeArgsError) -> Self {
        let s = e.to_string();
        match e {
            ServeArgsError::NoArrays => Self::AntennaArrays(s),
            ServeArgsError::Address { .. }
            | ServeArgsError::Duration(_)
            | ServeArgsError::ZeroSize(_)
            | ServeArgsError::Algorithm(_)
            | ServeArgsError::Mode(_) => Self::Serve(s),
        }
    }
}

impl From<PrediffArgsError> for CalServerError {
    fn from(e: PrediffArgsError) -> Self {
        Self::Prediffer(e.to_string())
    }
}

impl From<ServeError> for CalServerError {
    fn from(e: ServeError) -> Self {
        match e {
            ServeError::Server(e) => Self::from(e),
            ServeError::Acc(e) => Self::from(e),
        }
    }
}

impl From<ServerError> for CalServerError {
    fn from(e: ServerError) -> Self {
        Self::Handshake(e.to_string())
    }
}

impl From<ArrayConfigError> for CalServerError {
    fn from(e: ArrayConfigError) -> Self {
        Self::AntennaArrays(e.to_string())
    }
}

impl From<AccError> for CalServerError {
    fn from(e: AccError) -> Self {
        let s = e.to_string();
        match e {
            AccError::IO(e) => Self::from(e),
            AccError::ShapeMismatch { .. }
            | AccError::BadFilename(_)
            | AccError::PayloadSize { .. } => Self::Acc(s),
        }
    }
}

impl From<PredifferError> for CalServerError {
    fn from(e: PredifferError) -> Self {
        match e {
            PredifferError::Store(e) => Self::from(e),
            e => Self::Prediffer(e.to_string()),
        }
    }
}

impl From<StoreError> for CalServerError {
    fn from(e: StoreError) -> Self {
        let s = e.to_string();
        match e {
            StoreError::IO(e) => Self::from(e),
            _ => Self::Store(s),
        }
    }
}

impl From<std::io::Error> for CalServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
