// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parameters that are ready to use.
//!
//! The code here mirrors the `cli` module; `cli` holds unparsed, user-facing
//! arguments, whereas these parameters have been validated and only need
//! running.

mod prediff;
mod serve;

pub(crate) use prediff::PrediffParams;
pub(crate) use serve::{ServeError, ServeParams};
