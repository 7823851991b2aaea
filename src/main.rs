// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `calserver` binary.

use clap::Parser;
use log::error;

use lofar_calserver::CalServerCli;

fn main() {
    // Stolen from BurntSushi. We don't return Result from main because it
    // prints the debug representation of the error. The code below prints
    // the "display" or human readable representation of the error.
    if let Err(e) = CalServerCli::parse().run() {
        // If logging isn't set up yet, the message only goes to stderr.
        if log::log_enabled!(log::Level::Error) {
            error!("{e}");
        } else {
            eprintln!("Error: {e}");
        }
        std::process::exit(1);
    }
}
