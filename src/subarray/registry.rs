// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The registry of subarrays.
//!
//! Every subarray is in exactly one lifecycle phase. Additions and removals
//! are only scheduled when requested; they take effect when the calibration
//! pass calls [`SubArrays::creator`] and [`SubArrays::undertaker`], so a
//! subarray never appears or disappears in the middle of a pass.

use indexmap::IndexMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{AntennaGains, RegistryError, SubArray, Subscription};
use crate::{acc::Acc, calibrate::Calibrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Requested, but not yet calibrated.
    PendingAdd,

    /// Calibrated on every pass.
    Live,

    /// Still owned, but no longer calibrated; dropped at the next pass.
    PendingRemove,
}

#[derive(Debug)]
struct Entry {
    phase: Phase,
    subarray: SubArray,
}

#[derive(Debug, Default)]
pub struct SubArrays {
    entries: Mutex<IndexMap<String, Entry>>,
}

impl SubArrays {
    pub fn new() -> SubArrays {
        SubArrays::default()
    }

    /// Queue a subarray for addition. A name already in use in any phase is
    /// refused.
    pub fn schedule_add(&self, subarray: SubArray) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(subarray.name()) {
            return Err(RegistryError::Duplicate(subarray.name().to_string()));
        }
        debug!("Scheduling subarray '{}' for addition", subarray.name());
        entries.insert(
            subarray.name().to_string(),
            Entry {
                phase: Phase::PendingAdd,
                subarray,
            },
        );
        Ok(())
    }

    /// Queue a subarray for removal. One that hasn't been added yet is
    /// dropped straight away. Returns the phase the subarray was in.
    pub fn schedule_remove(&self, name: &str) -> Result<Phase, RegistryError> {
        let mut entries = self.entries.lock();
        match entries.get(name).map(|e| e.phase) {
            Some(Phase::PendingAdd) => {
                debug!("Dropping subarray '{name}' before it was added");
                entries.shift_remove(name);
                Ok(Phase::PendingAdd)
            }
            Some(Phase::Live) => {
                debug!("Scheduling subarray '{name}' for removal");
                if let Some(e) = entries.get_mut(name) {
                    e.phase = Phase::PendingRemove;
                }
                Ok(Phase::Live)
            }
            Some(Phase::PendingRemove) | None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Make every pending addition live. Returns how many were added.
    pub fn creator(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut num_added = 0;
        for (name, e) in entries.iter_mut() {
            if e.phase == Phase::PendingAdd {
                trace!("Subarray '{name}' is now live");
                e.phase = Phase::Live;
                num_added += 1;
            }
        }
        num_added
    }

    /// Drop every pending removal. Returns how many were removed.
    pub fn undertaker(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|name, e| {
            let keep = e.phase != Phase::PendingRemove;
            if !keep {
                trace!("Subarray '{name}' removed");
            }
            keep
        });
        before - entries.len()
    }

    /// Calibrate every live subarray that hasn't finished since its result
    /// was last published. A failing subarray is logged and left unfinished.
    /// Returns how many subarrays finished.
    pub fn calibrate(&self, calibrator: Option<&dyn Calibrator>, acc: &Acc) -> usize {
        let mut entries = self.entries.lock();
        let mut num_done = 0;
        for (name, e) in entries.iter_mut() {
            if e.phase != Phase::Live || e.subarray.is_done() {
                continue;
            }
            match e.subarray.calibrate(calibrator, acc) {
                Ok(true) => num_done += 1,
                Ok(false) => (),
                Err(err) => warn!("Couldn't calibrate subarray '{name}': {err}"),
            }
        }
        num_done
    }

    /// For every live subarray with a finished result: notify its
    /// subscribers, publish the result and clear the finished flag. Returns
    /// how many subarrays were updated.
    pub fn update_all(&self, sink: &mut dyn FnMut(&Subscription, &AntennaGains)) -> usize {
        let mut entries = self.entries.lock();
        let mut num_updated = 0;
        for e in entries.values_mut() {
            if e.phase != Phase::Live || !e.subarray.is_done() {
                continue;
            }
            e.subarray.notify(sink);
            e.subarray.publish();
            e.subarray.clear_done();
            num_updated += 1;
        }
        num_updated
    }

    /// Run `f` on a subarray that is live or waiting to be added.
    pub fn with_subarray<R>(&self, name: &str, f: impl FnOnce(&mut SubArray) -> R) -> Option<R> {
        let mut entries = self.entries.lock();
        match entries.get_mut(name) {
            Some(e) if e.phase != Phase::PendingRemove => Some(f(&mut e.subarray)),
            _ => None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<Phase> {
        self.entries.lock().get(name).map(|e| e.phase)
    }

    /// The names of all subarrays in a phase, in the order they were added.
    pub fn names(&self, phase: Phase) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.phase == phase)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
