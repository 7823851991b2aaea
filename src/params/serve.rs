// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, thread, time::Duration};

use log::{debug, error, info};
use thiserror::Error;

use crate::{
    acc::{AccBuffers, AccError, AccProducer, FileAccSource},
    calibrate::CalibrationAlgorithm,
    dispatch::{tcp::TcpTransport, Dispatcher},
    server::{CalServer, ServerConfig, ServerError},
    AntennaArrays,
};

#[derive(Debug)]
pub(crate) struct ServeParams {
    pub(crate) listen_addr: SocketAddr,
    pub(crate) driver_addr: SocketAddr,
    pub(crate) config: ServerConfig,
    pub(crate) arrays: AntennaArrays,
    pub(crate) num_subbands: usize,
    pub(crate) num_rcus: usize,
    pub(crate) algorithm: CalibrationAlgorithm,

    /// ACCs are read from this dump file and fed to the back buffer.
    pub(crate) acc_file: Option<PathBuf>,
    pub(crate) acc_interval: Duration,

    /// Stop serving after this long. Serve forever if not set.
    pub(crate) duration: Option<Duration>,
}

impl ServeParams {
    pub(crate) fn run(self) -> Result<(), ServeError> {
        let ServeParams {
            listen_addr,
            driver_addr,
            config,
            arrays,
            num_subbands,
            num_rcus,
            algorithm,
            acc_file,
            acc_interval,
            duration,
        } = self;

        let accs = Arc::new(AccBuffers::new(num_subbands, num_rcus));
        let producer = match acc_file {
            Some(file) => {
                let source = FileAccSource::new(&file)?;
                info!("Feeding ACCs from {} every {acc_interval:?}", file.display());
                Some(AccProducer::spawn(
                    Arc::clone(&accs),
                    Box::new(source),
                    acc_interval,
                ))
            }
            None => None,
        };

        let transport = TcpTransport::new(listen_addr, driver_addr, config.handshake_timeout);
        let mut dispatcher = Dispatcher::new(transport);
        let mut server = CalServer::new(config, arrays, accs, algorithm.calibrator());

        if let Some(duration) = duration {
            let stop = dispatcher.stop_handle();
            thread::Builder::new()
                .name("serve-timeout".to_string())
                .spawn(move || {
                    thread::sleep(duration);
                    debug!("Serving time is up");
                    stop.stop();
                })
                .expect("OS can create threads");
        }

        info!("Serving clients on {listen_addr}; RSP driver at {driver_addr}");
        let result = dispatcher
            .init(&mut server)
            .and_then(|()| dispatcher.run(&mut server));
        if let Some(producer) = producer {
            producer.stop();
        }
        if let Err(e) = &result {
            error!("Calibration server stopped: {e}");
        }
        result?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub(crate) enum ServeError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Acc(#[from] AccError),
}
