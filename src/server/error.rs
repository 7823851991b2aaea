// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use thiserror::Error;

/// Everything here is fatal; the server can't run without trustworthy
/// hardware parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("The station driver refused {request}")]
    HandshakeRefused { request: &'static str },

    #[error("The station driver didn't answer {request} within {timeout:?}")]
    HandshakeTimeout {
        request: &'static str,
        timeout: Duration,
    },

    #[error("The station driver reports {got} RCUs, but the ACCs are set up for {expected}")]
    RcuCount { expected: usize, got: u32 },

    #[error("The station driver reports a {0} MHz sampling clock, which isn't supported")]
    Clock(u32),
}
