//! Raw HCI/SCO socket collaborator.
//!
//! Owns the operations the transport core needs from the kernel's
//! Bluetooth socket layer for voice links: opening a raw SCO socket,
//! connecting it with a negotiated voice setting, and reading back its
//! negotiated MTU. Everything else about HCI (inquiry, pairing, adapter
//! management) belongs to the mediator, not here.

use crate::sock::sco;
use crate::Address;
use std::io::Result;

pub use sco::VoiceSetting;

/// Opens a raw SCO socket. `dev_id` selects the local controller by
/// index; routing to the correct adapter for an already-paired ACL link
/// is handled by the kernel once `connect` names the peer address.
pub fn sco_open(_dev_id: u16) -> Result<sco::Socket> {
    sco::Socket::open()
}

/// Connects an SCO socket to `addr` with the given voice setting.
pub async fn sco_connect(socket: &sco::Socket, addr: Address, voice: VoiceSetting) -> Result<()> {
    socket.connect(addr, voice).await
}

/// Reads back the negotiated MTU of a connected SCO socket.
pub fn sco_mtu(socket: &sco::Socket) -> Result<u16> {
    socket.mtu()
}
