//! The mediator IPC collaborator: a D-Bus proxy against the external
//! Bluetooth service's `org.bluez.MediaTransport1`-shaped interface.
//!
//! The transport core never talks to D-Bus directly outside this
//! module; everything above depends on the [`MediatorTransport`] trait
//! so tests can swap in a fake.

use std::os::unix::io::RawFd;
use std::time::Duration;

use async_trait::async_trait;
use dbus::nonblock::{Proxy, SyncConnection};
use std::sync::Arc;

const MEDIATOR_DEST: &str = "org.bluez";
const MEDIA_TRANSPORT_IFACE: &str = "org.bluez.MediaTransport1";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireMode {
    /// `Acquire`: blocks until the mediator can hand over a descriptor.
    Blocking,
    /// `TryAcquire`: used while the transport is `PENDING`, fails fast
    /// instead of waiting.
    TryAcquire,
}

#[derive(Clone, Copy, Debug)]
pub struct AcquireReply {
    pub fd: RawFd,
    pub mtu_read: u16,
    pub mtu_write: u16,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum MediatorError {
    #[error("mediator has no reply (NoReply)")]
    NoReply,
    #[error("mediator service is unknown (ServiceUnknown)")]
    ServiceUnknown,
    #[error("mediator object is unknown (UnknownObject)")]
    UnknownObject,
    #[error("mediator rpc failed: {0}")]
    Other(String),
}

impl MediatorError {
    /// Errors absorbed silently during `release`: the mediator or the
    /// transport object is already gone.
    pub fn is_benign_on_release(&self) -> bool {
        matches!(
            self,
            MediatorError::NoReply | MediatorError::ServiceUnknown | MediatorError::UnknownObject
        )
    }
}

impl From<dbus::Error> for MediatorError {
    fn from(err: dbus::Error) -> Self {
        match err.name() {
            Some("org.freedesktop.DBus.Error.NoReply") => MediatorError::NoReply,
            Some("org.freedesktop.DBus.Error.ServiceUnknown") => MediatorError::ServiceUnknown,
            Some("org.freedesktop.DBus.Error.UnknownObject") => MediatorError::UnknownObject,
            _ => MediatorError::Other(err.to_string()),
        }
    }
}

/// The contract the transport core consumes from the mediator: acquire,
/// release, codec configuration, and volume.
#[async_trait]
pub trait MediatorTransport: Send + Sync + std::fmt::Debug {
    async fn acquire(&self, path: &str, mode: AcquireMode) -> Result<AcquireReply, MediatorError>;
    async fn release(&self, path: &str) -> Result<(), MediatorError>;
    async fn set_configuration(&self, path: &str, configuration: &[u8]) -> Result<(), MediatorError>;
    async fn set_volume(&self, path: &str, owner: &str, volume: u16) -> Result<(), MediatorError>;
}

/// Real D-Bus-backed mediator proxy.
#[derive(Debug)]
pub struct DbusMediator {
    conn: Arc<SyncConnection>,
}

impl DbusMediator {
    pub fn new(conn: Arc<SyncConnection>) -> Self {
        Self { conn }
    }

    fn proxy<'a>(&'a self, owner: &'a str, path: &'a str) -> Proxy<'a, &'a SyncConnection> {
        Proxy::new(owner, path, CALL_TIMEOUT, self.conn.as_ref())
    }
}

#[async_trait]
impl MediatorTransport for DbusMediator {
    #[tracing::instrument(target = "mediator")]
    async fn acquire(&self, path: &str, mode: AcquireMode) -> Result<AcquireReply, MediatorError> {
        let method = match mode {
            AcquireMode::Blocking => "Acquire",
            AcquireMode::TryAcquire => "TryAcquire",
        };
        let proxy = self.proxy(MEDIATOR_DEST, path);
        let (fd, mtu_read, mtu_write): (dbus::arg::OwnedFd, u16, u16) =
            proxy.method_call(MEDIA_TRANSPORT_IFACE, method, ()).await?;
        Ok(AcquireReply {
            fd: fd.into_fd(),
            mtu_read,
            mtu_write,
        })
    }

    #[tracing::instrument(target = "mediator")]
    async fn release(&self, path: &str) -> Result<(), MediatorError> {
        let proxy = self.proxy(MEDIATOR_DEST, path);
        proxy
            .method_call(MEDIA_TRANSPORT_IFACE, "Release", ())
            .await?;
        Ok(())
    }

    #[tracing::instrument(target = "mediator")]
    async fn set_configuration(&self, path: &str, configuration: &[u8]) -> Result<(), MediatorError> {
        let proxy = self.proxy(MEDIATOR_DEST, path);
        proxy
            .method_call(
                MEDIA_TRANSPORT_IFACE,
                "SetConfiguration",
                (path, configuration.to_vec()),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(target = "mediator")]
    async fn set_volume(&self, path: &str, _owner: &str, volume: u16) -> Result<(), MediatorError> {
        use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
        let proxy = self.proxy(MEDIATOR_DEST, path);
        Properties::set(
            &proxy,
            MEDIA_TRANSPORT_IFACE,
            "Volume",
            dbus::arg::Variant(volume),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_on_release_matches_only_gone_errors() {
        assert!(MediatorError::NoReply.is_benign_on_release());
        assert!(MediatorError::ServiceUnknown.is_benign_on_release());
        assert!(MediatorError::UnknownObject.is_benign_on_release());
        assert!(!MediatorError::Other("boom".into()).is_benign_on_release());
    }

    #[test]
    fn dbus_error_names_map_to_the_expected_variant() {
        let no_reply = dbus::Error::new_custom("org.freedesktop.DBus.Error.NoReply", "timed out");
        assert!(matches!(MediatorError::from(no_reply), MediatorError::NoReply));

        let service_unknown =
            dbus::Error::new_custom("org.freedesktop.DBus.Error.ServiceUnknown", "gone");
        assert!(matches!(
            MediatorError::from(service_unknown),
            MediatorError::ServiceUnknown
        ));

        let other = dbus::Error::new_custom("org.bluez.Error.Failed", "nope");
        assert!(matches!(MediatorError::from(other), MediatorError::Other(_)));
    }
}
