// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The acquisition side of the ACC double buffer.

use std::{
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{select, tick, Sender};
use log::{debug, warn};

use super::{read_acc_dump, Acc, AccBuffers, AccError};

/// Something that can fill an ACC with fresh correlations.
pub trait AccSource: Send {
    fn fill(&mut self, acc: &mut Acc) -> Result<(), AccError>;
}

/// Replays a single ACC dump file, stamping each copy with the current time.
pub struct FileAccSource {
    template: Acc,
}

impl FileAccSource {
    pub fn new(file: &Path) -> Result<FileAccSource, AccError> {
        Ok(FileAccSource {
            template: read_acc_dump(file)?,
        })
    }

    pub fn from_acc(template: Acc) -> FileAccSource {
        FileAccSource { template }
    }
}

impl AccSource for FileAccSource {
    fn fill(&mut self, acc: &mut Acc) -> Result<(), AccError> {
        if acc.dim() != self.template.dim() {
            return Err(AccError::ShapeMismatch {
                expected: acc.dim(),
                got: self.template.dim(),
            });
        }
        acc.data_mut().assign(&self.template.data());
        acc.set_timestamp(Utc::now());
        Ok(())
    }
}

/// Fill the back slot if it needs filling. Returns whether a new cube was
/// committed.
pub fn produce_once(buffers: &AccBuffers, source: &mut dyn AccSource) -> Result<bool, AccError> {
    if buffers.is_back_valid() {
        return Ok(false);
    }
    let mut back = match buffers.lease_back() {
        Some(b) => b,
        None => return Ok(false),
    };
    source.fill(&mut back)?;
    back.commit();
    Ok(true)
}

/// A thread that periodically refills the back slot.
pub struct AccProducer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AccProducer {
    pub fn spawn(
        buffers: Arc<AccBuffers>,
        mut source: Box<dyn AccSource>,
        interval: Duration,
    ) -> AccProducer {
        let (tx_stop, rx_stop) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("acc-producer".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(rx_stop) -> _ => break,
                        recv(ticker) -> _ => {
                            match produce_once(&buffers, source.as_mut()) {
                                Ok(true) => debug!("Committed a new back ACC"),
                                Ok(false) => (),
                                Err(e) => warn!("Couldn't fill the back ACC: {e}"),
                            }
                        }
                    }
                }
                debug!("ACC producer finished");
            })
            .expect("OS can create threads");

        AccProducer {
            stop: Some(tx_stop),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the stop channel.
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("The ACC producer thread panicked");
            }
        }
    }
}

impl Drop for AccProducer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
