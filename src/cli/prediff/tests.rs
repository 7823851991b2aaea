// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::Write;

use approx::assert_abs_diff_eq;
use indoc::indoc;
use ndarray::prelude::*;
use serial_test::serial;
use tempfile::{tempdir, Builder, TempDir};

use super::*;
use crate::{
    c32,
    prediffer::{StoreMeta, VisStore},
};

/// Three stations at the same spot seeing a 1 Jy source; every cross
/// correlation is exactly 1.
fn unit_store() -> TempDir {
    let dir = tempdir().unwrap();
    let meta = StoreMeta {
        stations: ["CS001", "CS002", "CS003"].map(String::from).to_vec(),
        positions: vec![[0.0; 3]; 3],
        baselines: vec![(0, 1), (0, 2), (1, 2)],
        corr_names: vec!["XX".to_string(), "YY".to_string()],
        start_freq: 50e6,
        chan_width: 0.2e6,
        num_chan: 3,
        reverse_chan: false,
        times: vec![1.0, 3.0, 5.0],
        interval: 2.0,
    };
    let vis = Array4::from_elem((3, 3, 3, 2), c32::new(1.0, 0.0));
    let flags = Array4::from_elem((3, 3, 3, 2), false);
    VisStore::create(dir.path(), meta, vis.view(), flags.view()).unwrap();
    dir
}

#[test]
#[serial]
fn test_parse_defaults() {
    let args = PrediffArgs {
        store: Some(PathBuf::from("/data/obs.vis")),
        ..Default::default()
    };
    let params = args.parse().unwrap();
    assert_eq!(params.options, PredifferOptions::default());
    assert_eq!(params.iterations, DEFAULT_ITERATIONS);
    assert_abs_diff_eq!(params.damping, DEFAULT_DAMPING);
    assert_eq!(params.freq_range, (f64::NEG_INFINITY, f64::INFINITY));
    assert_eq!(params.time_range, (f64::NEG_INFINITY, f64::INFINITY));
    assert_eq!(params.direction, [0.0, 0.0, 1.0]);
    assert_abs_diff_eq!(params.flux, 1.0);
    assert!(!params.write_residuals);
    assert!(params.chans_per_cell.is_none());
}

#[test]
#[serial]
fn test_parse_selection() {
    let args = PrediffArgs {
        store: Some(PathBuf::from("/data/obs.vis")),
        stations: Some(vec!["CS*".to_string()]),
        correlation_type: Some("cross".to_string()),
        correlations: Some(vec!["xx".to_string(), "YY".to_string()]),
        num_threads: Some(2),
        times_per_chunk: Some(4),
        direction: Some(vec![0.0, 1.0, 0.0]),
        ..Default::default()
    };
    let params = args.parse().unwrap();
    assert_eq!(params.options.station_patterns, vec!["CS*".to_string()]);
    assert_eq!(params.options.correlation_type, CorrelationType::Cross);
    assert_eq!(params.options.correlation_names.len(), 2);
    assert_eq!(params.options.num_threads, 2);
    assert_eq!(params.options.times_per_chunk, 4);
    assert_eq!(params.direction, [0.0, 1.0, 0.0]);
}

#[test]
#[serial]
fn test_parse_errors() {
    assert!(matches!(
        PrediffArgs::default().parse(),
        Err(CalServerError::Prediffer(_))
    ));

    let store = || Some(PathBuf::from("/data/obs.vis"));
    let cases = [
        PrediffArgs {
            store: store(),
            correlation_type: Some("parallel".to_string()),
            ..Default::default()
        },
        PrediffArgs {
            store: store(),
            direction: Some(vec![1.0, 0.0]),
            ..Default::default()
        },
        PrediffArgs {
            store: store(),
            direction: Some(vec![0.0, 0.0, 0.0]),
            ..Default::default()
        },
        PrediffArgs {
            store: store(),
            times_per_chunk: Some(0),
            ..Default::default()
        },
        PrediffArgs {
            store: store(),
            chans_per_cell: Some(0),
            ..Default::default()
        },
        PrediffArgs {
            store: store(),
            damping: Some(-1.0),
            ..Default::default()
        },
    ];
    for args in cases {
        let result = args.clone().parse();
        assert!(
            matches!(result, Err(CalServerError::Prediffer(_))),
            "{args:?} gave {result:?}"
        );
    }
}

#[test]
fn test_merge_json() {
    let mut file = Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(
        indoc! {r#"
            {
                "store": "/data/obs.vis",
                "stations": ["CS*", "RS106"],
                "iterations": 3,
                "write_residuals": true
            }
        "#}
        .as_bytes(),
    )
    .unwrap();

    let cli = PrediffArgs {
        args_file: Some(file.path().to_path_buf()),
        iterations: Some(7),
        ..Default::default()
    };
    let merged = cli.merge().unwrap();
    assert_eq!(merged.store, Some(PathBuf::from("/data/obs.vis")));
    assert_eq!(merged.stations.unwrap().len(), 2);
    assert_eq!(merged.iterations, Some(7));
    assert!(merged.write_residuals);
}

#[test]
fn test_merge_unknown_extension() {
    let file = Builder::new().suffix(".yaml").tempfile().unwrap();
    let cli = PrediffArgs {
        args_file: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    assert!(matches!(cli.merge(), Err(CalServerError::ArgFile(_))));
}

#[test]
#[serial]
fn test_run_recovers_unit_gains() {
    let store = unit_store();
    let args = PrediffArgs {
        store: Some(store.path().to_path_buf()),
        num_threads: Some(2),
        times_per_chunk: Some(2),
        iterations: Some(3),
        write_residuals: true,
        ..Default::default()
    };
    let model = args.parse().unwrap().run().unwrap().unwrap();
    // Two chunks of at most two time steps, each one cell.
    assert_eq!(model.num_cells(), 2);
    for cell in 0..2 {
        for s in 0..3 {
            let g = model.gain(cell, s);
            assert_abs_diff_eq!(g.norm(), 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(g.arg(), 0.0, epsilon = 1e-6);
        }
    }

    let store = VisStore::open(store.path()).unwrap();
    let chunk = store.map_chunk(0..3).unwrap();
    for r in chunk.residual() {
        assert_abs_diff_eq!(r[0], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(r[1], 0.0, epsilon = 1e-5);
    }
}

#[test]
#[serial]
fn test_run_outside_data() {
    let store = unit_store();
    let args = PrediffArgs {
        store: Some(store.path().to_path_buf()),
        start_freq: Some(200e6),
        end_freq: Some(210e6),
        ..Default::default()
    };
    assert!(args.parse().unwrap().run().unwrap().is_none());
}
