// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Background calibration.
//!
//! The event thread leases the front ACC and hands the lease to the worker.
//! While the worker holds it the front stays locked, so no swap can happen
//! until calibration finishes and the lease is dropped.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use scopeguard::defer_on_unwind;

use crate::{acc::OwnedFrontLease, calibrate::Calibrator, subarray::SubArrays};

pub(super) struct CalThread {
    jobs: Option<Sender<OwnedFrontLease>>,
    done: Receiver<usize>,
    handle: Option<JoinHandle<()>>,

    /// Has a job been handed over that hasn't been reported back?
    busy: bool,

    /// A completion received but not yet collected by [`CalThread::poll`].
    completed: Option<usize>,
}

impl CalThread {
    pub(super) fn spawn(
        subarrays: Arc<SubArrays>,
        calibrator: Option<Arc<dyn Calibrator>>,
    ) -> CalThread {
        let (tx_jobs, rx_jobs) = crossbeam_channel::bounded::<OwnedFrontLease>(1);
        let (tx_done, rx_done) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("calibration".to_string())
            .spawn(move || {
                defer_on_unwind! { warn!("The calibration thread panicked"); }
                for front in rx_jobs.iter() {
                    let num_done = subarrays.calibrate(calibrator.as_deref(), &front);
                    // Unlock the front before reporting back.
                    drop(front);
                    trace!("Calibration thread finished {num_done} subarrays");
                    if tx_done.send(num_done).is_err() {
                        break;
                    }
                }
                debug!("Calibration thread finished");
            })
            .expect("OS can create threads");

        CalThread {
            jobs: Some(tx_jobs),
            done: rx_done,
            handle: Some(handle),
            busy: false,
            completed: None,
        }
    }

    pub(super) fn is_busy(&self) -> bool {
        self.busy
    }

    /// Hand a front lease to the worker. Returns `false` (and drops the
    /// lease) if the worker is gone or still busy.
    pub(super) fn submit(&mut self, front: OwnedFrontLease) -> bool {
        if self.busy {
            return false;
        }
        match &self.jobs {
            Some(jobs) if jobs.send(front).is_ok() => {
                self.busy = true;
                true
            }
            _ => false,
        }
    }

    /// If the worker has finished its job, collect the number of subarrays
    /// it calibrated.
    pub(super) fn poll(&mut self) -> Option<usize> {
        if let Some(n) = self.completed.take() {
            return Some(n);
        }
        if !self.busy {
            return None;
        }
        let n = self.done.try_recv().ok()?;
        self.busy = false;
        Some(n)
    }

    /// Block until the worker's current job finishes, or the timeout passes.
    /// The result is still collected by the next [`CalThread::poll`].
    pub(super) fn wait(&mut self, timeout: Duration) -> bool {
        if !self.busy {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(n) => {
                self.busy = false;
                self.completed = Some(n);
                true
            }
            Err(_) => false,
        }
    }

    /// Stop the worker and join it. Returns `false` if the worker panicked.
    pub(super) fn shutdown(&mut self) -> bool {
        // Disconnecting the job queue ends the worker's loop.
        drop(self.jobs.take());
        match self.handle.take().map(|h| h.join()) {
            Some(Err(_)) => {
                warn!("The calibration thread panicked");
                false
            }
            _ => true,
        }
    }
}

impl Drop for CalThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
