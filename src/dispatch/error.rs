// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use super::PortId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Port '{0}' isn't connected")]
    NotConnected(PortId),

    #[error("Port '{0}' isn't reading its messages; dropping it")]
    Stalled(PortId),

    #[error("Couldn't encode a message: {0}")]
    Encode(#[from] serde_json::Error),
}
