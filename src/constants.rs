// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

Frequencies are kept in Hz and durations in seconds unless a name says
otherwise.
 */

/// The number of subbands produced by the station's polyphase filter bank.
pub const NUM_SUBBANDS: usize = 512;

/// The largest bit index accepted in an RCU mask or subband set read from a
/// client. Well above any station's RCU count and [`NUM_SUBBANDS`].
pub const MAX_BIT_INDEX: usize = 65_535;

/// The number of polarisations per antenna (X and Y dipoles).
pub const NUM_POLS: usize = 2;

/// The sampling clocks the station hardware supports \[MHz\].
pub const VALID_CLOCKS_MHZ: [u32; 2] = [160, 200];

/// The highest Nyquist zone a subarray may be observed in.
pub const MAX_NYQUIST_ZONE: u8 = 3;

/// How often the server attempts an ACC swap and calibration pass \[seconds\].
pub const DEFAULT_TICK_PERIOD: f64 = 1.0;

/// How long the server waits for any one reply from the RSP driver during the
/// initial handshake \[seconds\].
pub const DEFAULT_HANDSHAKE_TIMEOUT: f64 = 10.0;

/// How long to wait before reconnecting to an unreachable RSP driver
/// \[seconds\].
pub const DEFAULT_RECONNECT_INTERVAL: f64 = 5.0;

/// The clock-update subscription period requested from the RSP driver
/// \[seconds\].
pub const CLOCK_SUBSCRIPTION_PERIOD: u32 = 1;

/// How often the ACC producer thread checks whether the back buffer needs
/// filling \[seconds\].
pub const DEFAULT_ACC_INTERVAL: f64 = 1.0;

/// The default address the server accepts client connections on.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:7300";

/// The default address of the RSP driver.
pub const DEFAULT_DRIVER_ADDRESS: &str = "127.0.0.1:7100";

/// The default number of time steps mapped per prediffer chunk.
pub const DEFAULT_TIMES_PER_CHUNK: usize = 16;

/// The default Levenberg damping used when solving prediffer normal
/// equations.
pub const DEFAULT_DAMPING: f64 = 1e-6;

/// Speed of light in a vacuum \[metres/second\].
pub const VEL_C: f64 = 299_792_458.0;

/// The number of RCUs of a standard station (48 dual-polarisation antennas).
pub const DEFAULT_NUM_RCUS: usize = 96;

/// The default number of solve iterations the prediffer runs per chunk.
pub const DEFAULT_ITERATIONS: usize = 10;
