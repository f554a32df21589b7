//! Bluetooth audio transport core: owns the acquisition, codec
//! configuration and worker-thread lifecycle of A2DP and SCO transports
//! exposed to local PCM clients.

pub mod addr;
pub mod device;
pub mod error;
pub mod hci;
pub mod mediator;
pub mod pcm;
pub mod registrar;
pub mod rfcomm;
pub mod sock;
pub mod transport;
pub mod worker;

pub use addr::Address;
