use crate::sock::{
    self, sock_priv,
    sys::{bt_voice, sockaddr_sco, BTPROTO_SCO, BT_VOICE, SOL_BLUETOOTH},
    Address, OwnedFd,
};
use libc::{
    AF_BLUETOOTH, EAGAIN, EINPROGRESS, MSG_PEEK, SHUT_RD, SHUT_RDWR, SHUT_WR, SOCK_SEQPACKET,
    SOL_SOCKET, SO_ERROR,
};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    net::Shutdown,
    os::{
        raw::c_int,
        unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    },
    task::{Context, Poll},
};
use tokio::io::{unix::AsyncFd, ReadBuf};

/// Voice setting negotiated on an SCO link, as reported by the `Acquire`
/// reply's `type.codec` pairing. Mirrors the HCI voice-setting values
/// used by `hci_conn_handle` in the kernel's SCO path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceSetting {
    Cvsd16Bit,
    Transparent,
}

impl From<VoiceSetting> for bt_voice {
    fn from(v: VoiceSetting) -> Self {
        use crate::sock::sys::{BT_VOICE_CVSD_16BIT, BT_VOICE_TRANSPARENT};
        bt_voice {
            setting: match v {
                VoiceSetting::Cvsd16Bit => BT_VOICE_CVSD_16BIT,
                VoiceSetting::Transparent => BT_VOICE_TRANSPARENT,
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddr {
    pub addr: Address,
}

impl sock::SysSockAddr for SocketAddr {
    type SysSockAddr = sockaddr_sco;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_sco {
            sco_family: AF_BLUETOOTH as _,
            sco_bdaddr: self.addr.into(),
        }
    }

    fn try_from_sys_sock_addr(saddr: Self::SysSockAddr) -> Result<Self> {
        if saddr.sco_family != AF_BLUETOOTH as _ {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "sockaddr_sco::sco_family is not AF_BLUETOOTH",
            ));
        }
        Ok(Self {
            addr: saddr.sco_bdaddr.into(),
        })
    }
}

/// A raw SCO socket, providing the HCI collaborator's `sco_open`/
/// `sco_connect`/`sco_mtu` operations.
pub struct Socket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("sco::Socket")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl Socket {
    /// `sco_open(dev_id)`. The `dev_id` selects the local adapter by
    /// binding to its address via `hci_devba`-equivalent lookup is left
    /// to the caller; here we bind to `BDADDR_ANY`, letting the kernel
    /// route the connect through the adapter already owning the ACL
    /// link to the peer.
    pub fn open() -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(sock::socket(AF_BLUETOOTH, SOCK_SEQPACKET, BTPROTO_SCO)?)?,
        })
    }

    pub fn bind(&self, sa: SocketAddr) -> Result<()> {
        sock::bind(self.fd.get_ref(), sa)
    }

    fn set_voice_setting(&self, voice: VoiceSetting) -> Result<()> {
        let opt: bt_voice = voice.into();
        sock::setsockopt(self.fd.get_ref(), SOL_BLUETOOTH, BT_VOICE, &opt)
    }

    /// `sco_connect(fd, addr, voice_setting)`.
    pub async fn connect(&self, addr: Address, voice: VoiceSetting) -> Result<()> {
        self.set_voice_setting(voice)?;
        self.connect_priv(SocketAddr { addr }).await
    }

    /// `sco_mtu(fd)`: SCO MTU is fixed by the negotiated voice setting
    /// and reported identically for read/write, unlike L2CAP.
    pub fn mtu(&self) -> Result<u16> {
        use crate::sock::sys::{sco_options, SCO_OPTIONS, SOL_SCO};
        let opts: sco_options = sock::getsockopt(self.fd.get_ref(), SOL_SCO, SCO_OPTIONS)?;
        Ok(opts.mtu)
    }

    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(OwnedFd::new(fd))?,
        })
    }

    fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_priv(buf).await
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_priv(buf).await
    }

    pub fn poll_recv(&self, cx: &mut Context, buf: &mut ReadBuf) -> Poll<Result<()>> {
        self.poll_recv_priv(cx, buf)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.shutdown_priv(how)
    }

    sock_priv!();
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_inner().into_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_raw_fd(fd).expect("from_raw_fd failed")
    }
}
