// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::str::FromStr;

use approx::assert_abs_diff_eq;

use super::*;
use crate::{
    array::tests::test_array,
    bitset::RcuMask,
    subarray::{tests::test_spectral_window, GainsBuffer, SubArray},
};

/// One subband, two antennas; RCU powers 4, 1, 0 and 9.
fn acc_with_powers() -> Acc {
    let mut acc = Acc::zeros(1, 4);
    for (rcu, power) in [4.0, 1.0, 0.0, 9.0].into_iter().enumerate() {
        acc.data_mut()[(0, rcu, rcu)] = c64::new(power, 0.0);
    }
    acc
}

#[test]
fn test_autocorr_gains() {
    let parent = test_array("LBA", 2);
    let mask: RcuMask = [0, 1, 2].into_iter().collect();
    let subarray = SubArray::new("sa", &parent, &mask, test_spectral_window(1)).unwrap();
    let mut gains = AntennaGains::new(2, 2, 1);

    AutoCorrelationCalibrator
        .calibrate(subarray.layout(), &acc_with_powers(), &mut gains)
        .unwrap();

    // Only RCUs 0 and 1 have power, so the mean is 2.5. RCU 3 has power but
    // isn't selected.
    let g = gains.gains();
    let q = gains.quality();
    assert_abs_diff_eq!(g[(0, 0, 0)].re, 1.6_f64.sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(g[(0, 1, 0)].re, 0.4_f64.sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(g[(1, 0, 0)].norm(), 0.0);
    assert_abs_diff_eq!(g[(1, 1, 0)].norm(), 0.0);
    assert_abs_diff_eq!(q[(0, 0, 0)], 1.0);
    assert_abs_diff_eq!(q[(1, 0, 0)], 0.0);
    assert_abs_diff_eq!(q[(1, 1, 0)], 0.0);
}

#[test]
fn test_autocorr_errors() {
    let parent = test_array("LBA", 4);
    let mask: RcuMask = [7].into_iter().collect();
    let subarray = SubArray::new("sa", &parent, &mask, test_spectral_window(1)).unwrap();

    let mut gains = AntennaGains::new(4, 2, 1);
    let result = AutoCorrelationCalibrator.calibrate(subarray.layout(), &acc_with_powers(), &mut gains);
    assert_eq!(
        result,
        Err(CalibrationError::RcuOutOfRange {
            rcu: 7,
            num_rcus: 4
        })
    );

    let mut gains = AntennaGains::new(4, 2, 3);
    let result = AutoCorrelationCalibrator.calibrate(subarray.layout(), &acc_with_powers(), &mut gains);
    assert_eq!(
        result,
        Err(CalibrationError::SubbandCount { acc: 1, gains: 3 })
    );
}

#[test]
fn test_subarray_calibrate_sets_front_done() {
    let parent = test_array("LBA", 2);
    let mask: RcuMask = [0, 1].into_iter().collect();
    let mut subarray = SubArray::new("sa", &parent, &mask, test_spectral_window(1)).unwrap();

    // Without an algorithm, nothing finishes.
    assert!(!subarray.calibrate(None, &acc_with_powers()).unwrap());
    assert!(!subarray.is_done());

    assert!(subarray
        .calibrate(Some(&AutoCorrelationCalibrator), &acc_with_powers())
        .unwrap());
    assert!(subarray.is_done());
    assert!(!subarray.gains(GainsBuffer::Back).is_done());
    assert_abs_diff_eq!(
        subarray.gains(GainsBuffer::Front).gains()[(0, 0, 0)].re,
        1.6_f64.sqrt(),
        epsilon = 1e-12
    );
}

#[test]
fn test_algorithm_names() {
    assert_eq!(
        CalibrationAlgorithm::from_str("autocorr").unwrap(),
        CalibrationAlgorithm::AutoCorrelation
    );
    assert!(CalibrationAlgorithm::None.calibrator().is_none());
    let calibrator = CalibrationAlgorithm::AutoCorrelation.calibrator().unwrap();
    assert_eq!(calibrator.name(), "autocorr");
    assert_eq!(CALIBRATION_ALGORITHMS.as_str(), "autocorr, none");
    assert!(CalibrationAlgorithm::from_str("stefcal").is_err());
}
