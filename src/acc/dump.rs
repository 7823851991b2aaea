// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Raw ACC dump files.
//!
//! A dump is named `YYYYMMDD_HHMMSS_acc_<subbands>x<rcus>x<rcus>.dat` and
//! holds the cube in (subband, rcu, rcu) order, each element a little-endian
//! f64 real part followed by a little-endian f64 imaginary part.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::debug;
use ndarray::prelude::*;

use super::{Acc, AccError};
use crate::c64;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const BYTES_PER_ELEMENT: u64 = 16;

pub fn acc_dump_filename(timestamp: DateTime<Utc>, dim: (usize, usize, usize)) -> String {
    format!(
        "{}_acc_{}x{}x{}.dat",
        timestamp.format(TIMESTAMP_FORMAT),
        dim.0,
        dim.1,
        dim.2
    )
}

/// Write the cube into `dir`, naming it after the cube's timestamp (or the
/// current time if it doesn't have one). Returns the path written.
pub fn write_acc_dump(dir: &Path, acc: &Acc) -> Result<PathBuf, AccError> {
    let timestamp = acc.timestamp().unwrap_or_else(Utc::now);
    let path = dir.join(acc_dump_filename(timestamp, acc.dim()));
    debug!("Writing ACC dump {}", path.display());

    let mut f = BufWriter::new(File::create(&path)?);
    for c in acc.data().iter() {
        f.write_f64::<LittleEndian>(c.re)?;
        f.write_f64::<LittleEndian>(c.im)?;
    }
    f.flush()?;
    Ok(path)
}

/// Parse the timestamp and dimensions out of a dump file name.
fn parse_dump_filename(name: &str) -> Option<(DateTime<Utc>, (usize, usize, usize))> {
    let stem = name.strip_suffix(".dat")?;
    let (time, dims) = stem.split_once("_acc_")?;
    let naive = NaiveDateTime::parse_from_str(time, TIMESTAMP_FORMAT).ok()?;
    let mut dims = dims.split('x').map(|d| d.parse::<usize>());
    let dim = match (dims.next(), dims.next(), dims.next(), dims.next()) {
        (Some(Ok(a)), Some(Ok(b)), Some(Ok(c)), None) => (a, b, c),
        _ => return None,
    };
    Some((Utc.from_utc_datetime(&naive), dim))
}

pub fn read_acc_dump(file: &Path) -> Result<Acc, AccError> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let (timestamp, dim) =
        parse_dump_filename(&name).ok_or_else(|| AccError::BadFilename(name.clone()))?;
    if dim.1 != dim.2 {
        return Err(AccError::BadFilename(name));
    }

    let expected = (dim.0 * dim.1 * dim.2) as u64 * BYTES_PER_ELEMENT;
    let got = std::fs::metadata(file)?.len();
    if got != expected {
        return Err(AccError::PayloadSize {
            file: file.display().to_string(),
            expected,
            got,
        });
    }

    debug!("Reading ACC dump {}", file.display());
    let mut f = BufReader::new(File::open(file)?);
    let mut data = Array3::zeros(dim);
    for c in data.iter_mut() {
        let re = f.read_f64::<LittleEndian>()?;
        let im = f.read_f64::<LittleEndian>()?;
        *c = c64::new(re, im);
    }

    Ok(Acc::from_array(data, Some(timestamp)))
}
