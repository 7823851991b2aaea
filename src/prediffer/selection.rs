// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Choosing which baselines and correlations the prediffer works on.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use super::{PredifferError, StoreMeta};

lazy_static::lazy_static! {
    pub(crate) static ref CORRELATION_TYPES: String = CorrelationType::iter().join(", ");
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum CorrelationType {
    /// Auto- and cross-correlations.
    #[default]
    All,

    /// Only baselines from a station to itself.
    Auto,

    /// Only baselines between different stations.
    Cross,
}

impl CorrelationType {
    pub fn accepts(self, station1: usize, station2: usize) -> bool {
        match self {
            CorrelationType::All => true,
            CorrelationType::Auto => station1 == station2,
            CorrelationType::Cross => station1 != station2,
        }
    }
}

/// Station indices whose names match any of `patterns`. No patterns means
/// every station.
pub fn select_stations(meta: &StoreMeta, patterns: &[String]) -> Result<Vec<usize>, PredifferError> {
    if patterns.is_empty() {
        return Ok((0..meta.num_stations()).collect());
    }
    let patterns = patterns
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<Result<Vec<_>, _>>()?;
    let selected: Vec<usize> = meta
        .stations
        .iter()
        .enumerate()
        .filter(|(_, name)| patterns.iter().any(|p| p.matches(name)))
        .map(|(i, _)| i)
        .collect();
    if selected.is_empty() {
        return Err(PredifferError::NoStations(
            patterns.iter().map(|p| p.as_str().to_string()).collect(),
        ));
    }
    Ok(selected)
}

/// Map from (station1, station2) to the baseline's row in the store, for
/// every baseline whose stations are both selected and whose kind is
/// accepted by `corr_type`.
pub fn select_baselines(
    meta: &StoreMeta,
    patterns: &[String],
    corr_type: CorrelationType,
) -> Result<BTreeMap<(usize, usize), usize>, PredifferError> {
    let stations = select_stations(meta, patterns)?;
    let baselines: BTreeMap<(usize, usize), usize> = meta
        .baselines
        .iter()
        .enumerate()
        .filter(|(_, (s1, s2))| {
            corr_type.accepts(*s1, *s2) && stations.contains(s1) && stations.contains(s2)
        })
        .map(|(row, &pair)| (pair, row))
        .collect();
    if baselines.is_empty() {
        return Err(PredifferError::NoBaselines);
    }
    debug!(
        "Selected {} of {} baselines ({} of {} stations, {corr_type})",
        baselines.len(),
        meta.num_baselines(),
        stations.len(),
        meta.num_stations()
    );
    Ok(baselines)
}

/// Indices of the named correlations. No names means all of them.
pub fn select_correlations(meta: &StoreMeta, names: &[String]) -> Result<Vec<usize>, PredifferError> {
    if names.is_empty() {
        return Ok((0..meta.num_corr()).collect());
    }
    names
        .iter()
        .map(|name| {
            meta.corr_names
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .ok_or_else(|| PredifferError::UnknownCorrelation {
                    name: name.clone(),
                    available: meta.corr_names.join(", "),
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|mut corrs| {
            corrs.sort_unstable();
            corrs.dedup();
            corrs
        })
}
