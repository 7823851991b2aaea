// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A subarray named '{0}' already exists")]
    Duplicate(String),

    #[error("No subarray named '{0}' is live or waiting to be added")]
    NotFound(String),
}
