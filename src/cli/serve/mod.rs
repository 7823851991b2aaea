// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.


use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use clap::Parser;
use itertools::Itertools;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use super::common::{display_warnings, seconds_to_duration, InfoPrinter, Warn, ARG_FILE_HELP};
use crate::{
    calibrate::{CalibrationAlgorithm, CALIBRATION_ALGORITHMS},
    constants::*,
    params::ServeParams,
    server::{CalibrationMode, ServerConfig},
    AntennaArrays, CalServerError,
};

lazy_static::lazy_static! {
    static ref ALGORITHM_HELP: String =
        format!("The calibration algorithm. Supported: {}. Default: {}", *CALIBRATION_ALGORITHMS, CalibrationAlgorithm::AutoCorrelation);

    static ref MODE_HELP: String =
        format!("Where calibration runs. Supported: {}. Default: {}", CalibrationMode::iter().join(", "), CalibrationMode::default());

    static ref LISTEN_HELP: String =
        format!("The address to accept calibration clients on. Default: {DEFAULT_LISTEN_ADDRESS}");

    static ref DRIVER_HELP: String =
        format!("The address of the RSP driver. Default: {DEFAULT_DRIVER_ADDRESS}");

    static ref TICK_HELP: String =
        format!("How often to swap ACCs and calibrate [seconds]. Default: {DEFAULT_TICK_PERIOD}");

    static ref HANDSHAKE_HELP: String =
        format!("How long to wait for each RSP driver reply during start up [seconds]. Default: {DEFAULT_HANDSHAKE_TIMEOUT}");

    static ref RECONNECT_HELP: String =
        format!("How long to wait before reconnecting to an unreachable RSP driver [seconds]. Default: {DEFAULT_RECONNECT_INTERVAL}");

    static ref NUM_RCUS_HELP: String =
        format!("The number of RCUs in each ACC. This must match what the RSP driver reports. Default: {DEFAULT_NUM_RCUS}");

    static ref NUM_SUBBANDS_HELP: String =
        format!("The number of subbands in each ACC. Default: {NUM_SUBBANDS}");

    static ref ACC_INTERVAL_HELP: String =
        format!("How often to check whether the back ACC needs refilling [seconds]. Default: {DEFAULT_ACC_INTERVAL}");
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct ServeArgs {
    #[clap(name = "ARGUMENTS_FILE", help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    pub(super) args_file: Option<PathBuf>,

    /// The TOML file describing the station's antenna arrays.
    #[clap(short, long, parse(from_os_str), help_heading = "ARRAYS")]
    pub(super) arrays: Option<PathBuf>,

    #[clap(long, help = LISTEN_HELP.as_str(), help_heading = "NETWORK")]
    pub(super) listen: Option<String>,

    #[clap(long, help = DRIVER_HELP.as_str(), help_heading = "NETWORK")]
    pub(super) driver: Option<String>,

    #[clap(long, help = HANDSHAKE_HELP.as_str(), help_heading = "NETWORK")]
    pub(super) handshake_timeout: Option<f64>,

    #[clap(long, help = RECONNECT_HELP.as_str(), help_heading = "NETWORK")]
    pub(super) reconnect_interval: Option<f64>,

    #[clap(long, help = TICK_HELP.as_str(), help_heading = "CALIBRATION")]
    pub(super) tick_period: Option<f64>,

    #[clap(long, help = ALGORITHM_HELP.as_str(), help_heading = "CALIBRATION")]
    pub(super) algorithm: Option<String>,

    #[clap(long, help = MODE_HELP.as_str(), help_heading = "CALIBRATION")]
    pub(super) mode: Option<String>,

    #[clap(long, help = NUM_RCUS_HELP.as_str(), help_heading = "ACCS")]
    pub(super) num_rcus: Option<usize>,

    #[clap(long, help = NUM_SUBBANDS_HELP.as_str(), help_heading = "ACCS")]
    pub(super) num_subbands: Option<usize>,

    /// An ACC dump file to feed into the server in place of live data.
    #[clap(long, parse(from_os_str), help_heading = "ACCS")]
    pub(super) acc_file: Option<PathBuf>,

    #[clap(long, help = ACC_INTERVAL_HELP.as_str(), help_heading = "ACCS")]
    pub(super) acc_interval: Option<f64>,

    /// Write every ACC that gets calibrated to disk.
    #[clap(long, help_heading = "ACCS")]
    #[serde(default)]
    pub(super) dump_accs: bool,

    /// The directory ACC dumps are written to. Default: the current directory.
    #[clap(long, parse(from_os_str), help_heading = "ACCS")]
    pub(super) dump_dir: Option<PathBuf>,

    /// Stop serving after this many seconds. The default is to serve until
    /// something fatal happens.
    #[clap(long)]
    pub(super) duration: Option<f64>,
}

impl ServeArgs {
    /// Both command-line and file arguments overlap in terms of what is
    /// available; this function consolidates everything that was specified into
    /// a single struct. Where applicable, it will prefer CLI parameters over
    /// those in the file.
    pub(super) fn merge(self) -> Result<ServeArgs, CalServerError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;

        if let Some(arg_file) = cli_args.args_file {
            // Ensure all of the file args are accounted for by pattern
            // matching.
            let ServeArgs {
                args_file: _,
                arrays,
                listen,
                driver,
                handshake_timeout,
                reconnect_interval,
                tick_period,
                algorithm,
                mode,
                num_rcus,
                num_subbands,
                acc_file,
                acc_interval,
                dump_accs,
                dump_dir,
                duration,
            } = unpack_arg_file!(arg_file);

            Ok(ServeArgs {
                args_file: None,
                arrays: cli_args.arrays.or(arrays),
                listen: cli_args.listen.or(listen),
                driver: cli_args.driver.or(driver),
                handshake_timeout: cli_args.handshake_timeout.or(handshake_timeout),
                reconnect_interval: cli_args.reconnect_interval.or(reconnect_interval),
                tick_period: cli_args.tick_period.or(tick_period),
                algorithm: cli_args.algorithm.or(algorithm),
                mode: cli_args.mode.or(mode),
                num_rcus: cli_args.num_rcus.or(num_rcus),
                num_subbands: cli_args.num_subbands.or(num_subbands),
                acc_file: cli_args.acc_file.or(acc_file),
                acc_interval: cli_args.acc_interval.or(acc_interval),
                dump_accs: cli_args.dump_accs || dump_accs,
                dump_dir: cli_args.dump_dir.or(dump_dir),
                duration: cli_args.duration.or(duration),
            })
        } else {
            Ok(cli_args)
        }
    }

    pub(super) fn parse(self) -> Result<ServeParams, CalServerError> {
        debug!("{:#?}", self);

        let ServeArgs {
            args_file: _,
            arrays,
            listen,
            driver,
            handshake_timeout,
            reconnect_interval,
            tick_period,
            algorithm,
            mode,
            num_rcus,
            num_subbands,
            acc_file,
            acc_interval,
            dump_accs,
            dump_dir,
            duration,
        } = self;

        let arrays_file = arrays.ok_or(ServeArgsError::NoArrays)?;
        let arrays = AntennaArrays::read_file(&arrays_file)?;

        let listen_addr = parse_address(listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDRESS))?;
        let driver_addr = parse_address(driver.as_deref().unwrap_or(DEFAULT_DRIVER_ADDRESS))?;

        let duration_arg = |value: Option<f64>, default: f64, what: &str| {
            seconds_to_duration(value.unwrap_or(default), what).map_err(ServeArgsError::Duration)
        };
        let tick_period = duration_arg(tick_period, DEFAULT_TICK_PERIOD, "tick period")?;
        let handshake_timeout =
            duration_arg(handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT, "handshake timeout")?;
        let reconnect_interval =
            duration_arg(reconnect_interval, DEFAULT_RECONNECT_INTERVAL, "reconnect interval")?;
        let acc_interval = duration_arg(acc_interval, DEFAULT_ACC_INTERVAL, "ACC interval")?;
        let duration = duration
            .map(|d| seconds_to_duration(d, "serving duration"))
            .transpose()
            .map_err(ServeArgsError::Duration)?;

        let algorithm = match algorithm {
            Some(a) => CalibrationAlgorithm::from_str(&a.to_lowercase())
                .map_err(|_| ServeArgsError::Algorithm(a))?,
            None => CalibrationAlgorithm::AutoCorrelation,
        };
        let mode = match mode {
            Some(m) => {
                CalibrationMode::from_str(&m.to_lowercase()).map_err(|_| ServeArgsError::Mode(m))?
            }
            None => CalibrationMode::default(),
        };

        let num_rcus = num_rcus.unwrap_or(DEFAULT_NUM_RCUS);
        if num_rcus == 0 {
            return Err(ServeArgsError::ZeroSize("RCUs").into());
        }
        let num_subbands = num_subbands.unwrap_or(NUM_SUBBANDS);
        if num_subbands == 0 {
            return Err(ServeArgsError::ZeroSize("subbands").into());
        }
        if let Some(largest) = arrays.iter().map(|a| a.num_rcus()).max() {
            if largest > num_rcus {
                format!("The largest antenna array has {largest} RCUs, but ACCs only have {num_rcus}; subarrays using the extra RCUs will be refused").warn();
            }
        }

        let dump_dir = match (dump_accs, dump_dir) {
            (true, dir) => Some(dir.unwrap_or_else(|| PathBuf::from("."))),
            (false, Some(dir)) => {
                format!(
                    "An ACC dump directory ({}) was given without --dump-accs; not dumping",
                    dir.display()
                )
                .warn();
                None
            }
            (false, None) => None,
        };
        if algorithm == CalibrationAlgorithm::None {
            "No calibration algorithm; subscribers will never receive updates".warn();
        }

        let mut printer = InfoPrinter::new("Calibration server set up".into());
        printer.push_block(vec![
            format!("Antenna arrays: {}", arrays_file.display()).into(),
            format!(
                "  {}",
                arrays
                    .iter()
                    .map(|a| format!("{} ({} antennas)", a.name, a.num_antennas()))
                    .join(", ")
            )
            .into(),
        ]);
        printer.push_block(vec![
            format!("Clients on {listen_addr}").into(),
            format!("RSP driver at {driver_addr}").into(),
        ]);
        printer.push_block(vec![
            format!("ACCs: {num_subbands} subbands x {num_rcus} RCUs").into(),
            match &acc_file {
                Some(f) => format!("Fed from {} every {acc_interval:?}", f.display()).into(),
                None => "No ACC source; waiting for ACCs from elsewhere".into(),
            },
        ]);
        printer.push_line(
            format!("Calibrating with '{algorithm}' ({mode}) every {tick_period:?}").into(),
        );
        if let Some(dir) = &dump_dir {
            printer.push_line(format!("Dumping ACCs into {}", dir.display()).into());
        }
        printer.display();
        display_warnings();

        Ok(ServeParams {
            listen_addr,
            driver_addr,
            config: ServerConfig {
                tick_period,
                handshake_timeout,
                reconnect_interval,
                mode,
                dump_dir,
            },
            arrays,
            num_subbands,
            num_rcus,
            algorithm,
            acc_file,
            acc_interval,
            duration,
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

fn parse_address(addr: &str) -> Result<SocketAddr, ServeArgsError> {
    addr.parse().map_err(|e: std::net::AddrParseError| ServeArgsError::Address {
        addr: addr.to_string(),
        err: e.to_string(),
    })
}

#[derive(thiserror::Error, Debug)]
pub(super) enum ServeArgsError {
    #[error("No antenna arrays file was specified")]
    NoArrays,

    #[error("Couldn't parse '{addr}' as an address: {err}")]
    Address { addr: String, err: String },

    #[error("{0}")]
    Duration(String),

    #[error("The number of {0} must be at least 1")]
    ZeroSize(&'static str),

    #[error("'{0}' isn't a calibration algorithm; supported: {}", *CALIBRATION_ALGORITHMS)]
    Algorithm(String),

    #[error("'{0}' isn't a calibration mode; supported: {}", CalibrationMode::iter().join(", "))]
    Mode(String),
}
