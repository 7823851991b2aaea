// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A columnar visibility store on disk.
//!
//! A store is a directory holding
//! - `meta.json`: a serialised [`StoreMeta`];
//! - `vis.dat`: visibilities as pairs of f32 (real, imaginary), ordered
//!   [time][baseline][physical channel][correlation];
//! - `flags.dat`: one bit per visibility in the same order, least
//!   significant bit first, each time step padded to a whole byte;
//! - `residual.dat`: laid out exactly like `vis.dat`, written by the
//!   prediffer.
//!
//! Data are stored in native byte order (little endian on every platform we
//! run on). When `reverse_chan` is set, physical channel 0 holds the highest
//! frequency.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    ops::Range,
    path::{Path, PathBuf},
};

use byteorder::{NativeEndian, WriteBytesExt};
use log::debug;
use memmap2::{Mmap, MmapMut, MmapOptions};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::c32;

const META_FILENAME: &str = "meta.json";
const VIS_FILENAME: &str = "vis.dat";
const FLAGS_FILENAME: &str = "flags.dat";
const RESIDUAL_FILENAME: &str = "residual.dat";

/// Bytes taken by one visibility.
const VIS_BYTES: usize = std::mem::size_of::<[f32; 2]>();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub stations: Vec<String>,

    /// Geocentric station positions \[metres\].
    pub positions: Vec<[f64; 3]>,

    /// Station index pairs; the position in this list is the baseline's row.
    pub baselines: Vec<(usize, usize)>,

    /// e.g. `["XX", "XY", "YX", "YY"]`.
    pub corr_names: Vec<String>,

    /// The lower edge of the lowest frequency channel \[Hz\].
    pub start_freq: f64,

    /// \[Hz\]
    pub chan_width: f64,

    pub num_chan: usize,

    /// Are channels stored from high to low frequency?
    pub reverse_chan: bool,

    /// Centroids of the time steps \[seconds\]. Ascending.
    pub times: Vec<f64>,

    /// \[seconds\]
    pub interval: f64,
}

impl StoreMeta {
    pub fn num_stations(&self) -> usize {
        self.stations.len()
    }

    pub fn num_baselines(&self) -> usize {
        self.baselines.len()
    }

    pub fn num_corr(&self) -> usize {
        self.corr_names.len()
    }

    pub fn num_times(&self) -> usize {
        self.times.len()
    }

    /// The number of visibilities in one time step.
    pub fn vis_per_time(&self) -> usize {
        self.num_baselines() * self.num_chan * self.num_corr()
    }

    pub fn flag_bytes_per_time(&self) -> usize {
        (self.vis_per_time() + 7) / 8
    }

    /// Index of a visibility within its time step.
    pub fn vis_index(&self, row: usize, physical_chan: usize, corr: usize) -> usize {
        (row * self.num_chan + physical_chan) * self.num_corr() + corr
    }

    /// The physical channel holding frequency-ordered channel `chan`.
    pub fn physical_chan(&self, chan: usize) -> usize {
        if self.reverse_chan {
            self.num_chan - 1 - chan
        } else {
            chan
        }
    }

    /// The frequency range of frequency-ordered channel `chan` \[Hz\].
    pub fn chan_edges(&self, chan: usize) -> (f64, f64) {
        let lo = self.start_freq + chan as f64 * self.chan_width;
        (lo, lo + self.chan_width)
    }

    pub fn chan_centre(&self, chan: usize) -> f64 {
        self.start_freq + (chan as f64 + 0.5) * self.chan_width
    }

    /// The time range covered by time step `t` \[seconds\].
    pub fn time_edges(&self, t: usize) -> (f64, f64) {
        let half = self.interval / 2.0;
        (self.times[t] - half, self.times[t] + half)
    }

    fn validate(&self) -> Result<(), StoreError> {
        let num_stations = self.num_stations();
        if self.positions.len() != num_stations {
            return Err(StoreError::PositionCount {
                num_stations,
                num_positions: self.positions.len(),
            });
        }
        for (index, &(s1, s2)) in self.baselines.iter().enumerate() {
            let station = s1.max(s2);
            if station >= num_stations {
                return Err(StoreError::BadBaseline {
                    index,
                    station,
                    num_stations,
                });
            }
        }
        if !(self.chan_width.is_finite() && self.chan_width > 0.0) {
            return Err(StoreError::ChannelWidth(self.chan_width));
        }
        Ok(())
    }
}

pub struct VisStore {
    dir: PathBuf,
    meta: StoreMeta,
    vis: File,
    flags: File,
    residual: File,
}

impl VisStore {
    pub fn open(dir: &Path) -> Result<VisStore, StoreError> {
        debug!("Opening visibility store {}", dir.display());
        let meta: StoreMeta = serde_json::from_reader(File::open(dir.join(META_FILENAME))?)?;
        meta.validate()?;

        let num_times = meta.num_times() as u64;
        let vis_size = num_times * (meta.vis_per_time() * VIS_BYTES) as u64;
        let flags_size = num_times * meta.flag_bytes_per_time() as u64;
        let vis = open_sized(&dir.join(VIS_FILENAME), vis_size, false)?;
        let flags = open_sized(&dir.join(FLAGS_FILENAME), flags_size, false)?;
        let residual = open_sized(&dir.join(RESIDUAL_FILENAME), vis_size, true)?;

        Ok(VisStore {
            dir: dir.to_path_buf(),
            meta,
            vis,
            flags,
            residual,
        })
    }

    /// Write a new store into `dir` (which must exist). `vis` and `flags` are
    /// in frequency order with shape (time, baseline, channel, correlation);
    /// they're reordered into storage order as required. The residual column
    /// starts zeroed.
    pub fn create(
        dir: &Path,
        meta: StoreMeta,
        vis: ArrayView4<c32>,
        flags: ArrayView4<bool>,
    ) -> Result<VisStore, StoreError> {
        meta.validate()?;
        let expected = (
            meta.num_times(),
            meta.num_baselines(),
            meta.num_chan,
            meta.num_corr(),
        );
        for got in [vis.dim(), flags.dim()] {
            if got != expected {
                return Err(StoreError::Shape { expected, got });
            }
        }
        debug!("Creating visibility store {}", dir.display());

        serde_json::to_writer_pretty(File::create(dir.join(META_FILENAME))?, &meta)?;

        let mut vis_file = BufWriter::new(File::create(dir.join(VIS_FILENAME))?);
        let mut flags_file = BufWriter::new(File::create(dir.join(FLAGS_FILENAME))?);
        let mut packed = vec![0; meta.flag_bytes_per_time()];
        for (vis_t, flags_t) in vis.outer_iter().zip(flags.outer_iter()) {
            packed.iter_mut().for_each(|b| *b = 0);
            for (vis_bl, flags_bl) in vis_t.outer_iter().zip(flags_t.outer_iter()) {
                for phys in 0..meta.num_chan {
                    let chan = meta.physical_chan(phys);
                    for v in vis_bl.slice(s![chan, ..]) {
                        vis_file.write_f32::<NativeEndian>(v.re)?;
                        vis_file.write_f32::<NativeEndian>(v.im)?;
                    }
                }
            }
            for ((row, chan, corr), &flag) in flags_t.indexed_iter() {
                if flag {
                    let i = meta.vis_index(row, meta.physical_chan(chan), corr);
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            flags_file.write_all(&packed)?;
        }
        vis_file.flush()?;
        flags_file.flush()?;

        let residual = File::create(dir.join(RESIDUAL_FILENAME))?;
        residual.set_len((meta.num_times() * meta.vis_per_time() * VIS_BYTES) as u64)?;
        drop(residual);

        VisStore::open(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Map exactly the bytes of time steps `times` from every column.
    pub fn map_chunk(&self, times: Range<usize>) -> Result<Chunk, StoreError> {
        if times.is_empty() || times.end > self.meta.num_times() {
            return Err(StoreError::TimeRange(
                format!("{times:?}"),
                self.meta.num_times(),
            ));
        }
        let num_times = times.len();
        let vis_per_time = self.meta.vis_per_time();
        let vis_stride = (vis_per_time * VIS_BYTES) as u64;
        let flag_stride = self.meta.flag_bytes_per_time();
        let first = times.start as u64;

        // Safety: the files are only ever resized by `create`, and the
        // residual column is only written through this mapping.
        let (vis, flags, residual) = unsafe {
            let vis = MmapOptions::new()
                .offset(first * vis_stride)
                .len(num_times * vis_stride as usize)
                .map(&self.vis)?;
            let flags = MmapOptions::new()
                .offset(first * flag_stride as u64)
                .len(num_times * flag_stride)
                .map(&self.flags)?;
            let residual = MmapOptions::new()
                .offset(first * vis_stride)
                .len(num_times * vis_stride as usize)
                .map_mut(&self.residual)?;
            (vis, flags, residual)
        };
        bytemuck::try_cast_slice::<u8, [f32; 2]>(&vis).map_err(StoreError::Misaligned)?;
        bytemuck::try_cast_slice::<u8, [f32; 2]>(&residual).map_err(StoreError::Misaligned)?;

        Ok(Chunk {
            times,
            vis_per_time,
            flag_stride,
            vis,
            flags,
            residual,
        })
    }
}

fn open_sized(path: &Path, expected: u64, writable: bool) -> Result<File, StoreError> {
    let file = OpenOptions::new().read(true).write(writable).open(path)?;
    let got = file.metadata()?.len();
    if got != expected {
        return Err(StoreError::FileSize {
            file: path.display().to_string(),
            expected,
            got,
        });
    }
    Ok(file)
}

/// A contiguous run of time steps mapped into memory. The maps are released
/// when this is dropped.
pub struct Chunk {
    times: Range<usize>,
    vis_per_time: usize,
    flag_stride: usize,
    vis: Mmap,
    flags: Mmap,
    residual: MmapMut,
}

impl Chunk {
    /// The store time steps in this chunk.
    pub fn times(&self) -> Range<usize> {
        self.times.clone()
    }

    pub fn num_times(&self) -> usize {
        self.times.len()
    }

    /// Every visibility in the chunk. Alignment was checked when mapping.
    pub fn vis(&self) -> &[[f32; 2]] {
        bytemuck::cast_slice(&self.vis)
    }

    /// The visibilities of the chunk's `t`th time step.
    pub fn vis_at(&self, t: usize) -> &[[f32; 2]] {
        &self.vis()[t * self.vis_per_time..(t + 1) * self.vis_per_time]
    }

    /// The packed flags of the chunk's `t`th time step.
    pub fn flags_at(&self, t: usize) -> &[u8] {
        &self.flags[t * self.flag_stride..(t + 1) * self.flag_stride]
    }

    /// The input column alongside the writable residual column.
    pub fn vis_and_residual_mut(&mut self) -> (&[[f32; 2]], &mut [[f32; 2]]) {
        (
            bytemuck::cast_slice(&self.vis),
            bytemuck::cast_slice_mut(&mut self.residual),
        )
    }

    pub fn residual(&self) -> &[[f32; 2]] {
        bytemuck::cast_slice(&self.residual)
    }

    pub fn vis_per_time(&self) -> usize {
        self.vis_per_time
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.residual.flush()?;
        Ok(())
    }
}

/// Unpack one time step of flags into `out`, one bool per visibility.
pub fn unpack_flags(packed: &[u8], out: &mut [bool]) {
    for (i, flag) in out.iter_mut().enumerate() {
        *flag = packed[i / 8] & (1 << (i % 8)) != 0;
    }
}
