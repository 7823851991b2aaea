// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Array correlation cubes (ACCs) and the double buffer that hands them from
//! the acquisition side to the calibration side.
//!
//! The calibration pass only ever reads the front slot and the producer only
//! ever writes the back slot. Access to either slot goes through a lease; a
//! leased slot is "locked", and the two slots can only trade places when
//! neither is leased and the back slot holds a complete cube.

mod dump;
mod error;
mod source;

pub use dump::{acc_dump_filename, read_acc_dump, write_acc_dump};
pub use error::{AccError, SwapRefused};
pub use source::{produce_once, AccProducer, AccSource, FileAccSource};

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::trace;
use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::c64;

/// One array correlation cube. The first dimension is subband, the second
/// and third are RCU.
#[derive(Debug, Clone, PartialEq)]
pub struct Acc {
    data: Array3<c64>,

    /// When the correlations were integrated, if known.
    timestamp: Option<DateTime<Utc>>,
}

impl Acc {
    pub fn zeros(num_subbands: usize, num_rcus: usize) -> Acc {
        Acc {
            data: Array3::zeros((num_subbands, num_rcus, num_rcus)),
            timestamp: None,
        }
    }

    pub fn from_array(data: Array3<c64>, timestamp: Option<DateTime<Utc>>) -> Acc {
        Acc { data, timestamp }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn num_subbands(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn num_rcus(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn data(&self) -> ArrayView3<c64> {
        self.data.view()
    }

    pub fn data_mut(&mut self) -> ArrayViewMut3<c64> {
        self.data.view_mut()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = Some(timestamp);
    }
}

#[derive(Debug)]
struct Slot {
    /// `None` while the slot is leased out.
    acc: Option<Acc>,

    /// Does the slot hold a complete cube?
    valid: bool,
}

#[derive(Debug)]
struct Slots {
    front: Slot,
    back: Slot,
    num_swaps: u64,
}

impl Slots {
    fn readiness(&self) -> Result<(), SwapRefused> {
        if self.front.acc.is_none() {
            Err(SwapRefused::FrontLocked)
        } else if self.back.acc.is_none() {
            Err(SwapRefused::BackLocked)
        } else if !self.back.valid {
            Err(SwapRefused::BackNotValid)
        } else {
            Ok(())
        }
    }

    fn swap(&mut self) {
        let incoming = self.back.valid;
        std::mem::swap(&mut self.front, &mut self.back);
        // Validity travels with the cube. The old front must be refilled
        // before it can come forward again.
        self.front.valid = incoming;
        self.back.valid = false;
        self.num_swaps += 1;
    }
}

/// The two-slot ACC resource shared by the producer and the calibration pass.
#[derive(Debug)]
pub struct AccBuffers {
    slots: Mutex<Slots>,
    shape: (usize, usize, usize),
}

impl AccBuffers {
    /// Both slots start zeroed and invalid.
    pub fn new(num_subbands: usize, num_rcus: usize) -> AccBuffers {
        let slot = || Slot {
            acc: Some(Acc::zeros(num_subbands, num_rcus)),
            valid: false,
        };
        AccBuffers {
            slots: Mutex::new(Slots {
                front: slot(),
                back: slot(),
                num_swaps: 0,
            }),
            shape: (num_subbands, num_rcus, num_rcus),
        }
    }

    /// The shape of both cubes.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    /// Borrow the front cube for reading. Returns `None` if it's already
    /// leased. No swap can happen until the lease is dropped.
    pub fn lease_front(&self) -> Option<FrontLease<'_>> {
        let acc = self.slots.lock().front.acc.take()?;
        Some(FrontLease {
            buffers: self,
            acc: Some(acc),
        })
    }

    /// As [`AccBuffers::lease_front`], but the lease keeps the buffers alive
    /// so it can be handed to another thread.
    pub fn lease_front_owned(self: &Arc<Self>) -> Option<OwnedFrontLease> {
        let acc = self.slots.lock().front.acc.take()?;
        Some(OwnedFrontLease {
            buffers: Arc::clone(self),
            acc: Some(acc),
        })
    }

    /// Borrow the back cube for filling. Returns `None` if it's already
    /// leased. Leasing the back slot invalidates it until the lease is
    /// committed.
    pub fn lease_back(&self) -> Option<BackLease<'_>> {
        let mut slots = self.slots.lock();
        let acc = slots.back.acc.take()?;
        slots.back.valid = false;
        Some(BackLease {
            buffers: self,
            acc: Some(acc),
        })
    }

    pub fn is_front_locked(&self) -> bool {
        self.slots.lock().front.acc.is_none()
    }

    pub fn is_back_locked(&self) -> bool {
        self.slots.lock().back.acc.is_none()
    }

    pub fn is_front_valid(&self) -> bool {
        self.slots.lock().front.valid
    }

    pub fn is_back_valid(&self) -> bool {
        self.slots.lock().back.valid
    }

    /// Would [`AccBuffers::try_swap`] succeed right now?
    pub fn swap_readiness(&self) -> Result<(), SwapRefused> {
        self.slots.lock().readiness()
    }

    /// Exchange the front and back slots, but only if neither is leased and
    /// the back slot holds a complete cube. On refusal, nothing changes.
    pub fn try_swap(&self) -> Result<(), SwapRefused> {
        let mut slots = self.slots.lock();
        slots.readiness()?;
        slots.swap();
        trace!("ACC swap {} done", slots.num_swaps);
        Ok(())
    }

    /// Exchange the slots even if the back slot isn't complete. Leased slots
    /// still can't be swapped.
    pub fn force_swap(&self) -> Result<(), SwapRefused> {
        let mut slots = self.slots.lock();
        match slots.readiness() {
            Ok(()) | Err(SwapRefused::BackNotValid) => {
                slots.swap();
                trace!("ACC swap {} forced", slots.num_swaps);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// How many swaps have happened since creation.
    pub fn num_swaps(&self) -> u64 {
        self.slots.lock().num_swaps
    }
}

/// Read access to the front cube. Dropping the lease unlocks the slot.
#[derive(Debug)]
pub struct FrontLease<'a> {
    buffers: &'a AccBuffers,
    acc: Option<Acc>,
}

impl Deref for FrontLease<'_> {
    type Target = Acc;

    fn deref(&self) -> &Acc {
        self.acc.as_ref().expect("only taken on drop")
    }
}

impl Drop for FrontLease<'_> {
    fn drop(&mut self) {
        if let Some(acc) = self.acc.take() {
            self.buffers.slots.lock().front.acc = Some(acc);
        }
    }
}

#[derive(Debug)]
pub struct OwnedFrontLease {
    buffers: Arc<AccBuffers>,
    acc: Option<Acc>,
}

impl Deref for OwnedFrontLease {
    type Target = Acc;

    fn deref(&self) -> &Acc {
        self.acc.as_ref().expect("only taken on drop")
    }
}

impl Drop for OwnedFrontLease {
    fn drop(&mut self) {
        if let Some(acc) = self.acc.take() {
            self.buffers.slots.lock().front.acc = Some(acc);
        }
    }
}

/// Write access to the back cube. Call [`BackLease::commit`] once the cube
/// is complete; dropping the lease otherwise leaves the slot invalid.
#[derive(Debug)]
pub struct BackLease<'a> {
    buffers: &'a AccBuffers,
    acc: Option<Acc>,
}

impl BackLease<'_> {
    /// Return the cube to the back slot and mark it complete.
    pub fn commit(mut self) {
        if let Some(acc) = self.acc.take() {
            let mut slots = self.buffers.slots.lock();
            slots.back.acc = Some(acc);
            slots.back.valid = true;
        }
    }
}

impl Deref for BackLease<'_> {
    type Target = Acc;

    fn deref(&self) -> &Acc {
        self.acc.as_ref().expect("only taken on drop or commit")
    }
}

impl DerefMut for BackLease<'_> {
    fn deref_mut(&mut self) -> &mut Acc {
        self.acc.as_mut().expect("only taken on drop or commit")
    }
}

impl Drop for BackLease<'_> {
    fn drop(&mut self) {
        if let Some(acc) = self.acc.take() {
            self.buffers.slots.lock().back.acc = Some(acc);
        }
    }
}
