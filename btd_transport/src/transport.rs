//! The transport object graph: per-link codec configuration, remote
//! socket acquisition, PCM endpoints and worker-task handles.
//!
//! This module is the core of the crate. A [`Transport`] is either an
//! A2DP link (streamed audio) or an SCO link (synchronous voice),
//! always in one profile role, and owns up to two [`WorkerHandle`]s
//! that drive the PCM ↔ remote-socket data path. Reference counting and
//! destruction ordering are implemented on [`Device`], which is the
//! only thing allowed to mutate a transport's presence in its map.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use libc::{SOL_SOCKET, SO_SNDBUF, TIOCOUTQ};
use tokio::sync::Mutex as AsyncMutex;

use btd_core::codec::{A2dpCodecId, PcmShape, ScoCodecId};

use crate::error::{Result, TransportError, TransportInternalError};
use crate::hci::{self, VoiceSetting};
use crate::mediator::{AcquireMode, MediatorError, MediatorTransport};
use crate::pcm::{pcms_lock, Pcm, PcmMode, WorkerRole};
use crate::registrar::{PcmRegistrar, PcmUpdateMask};
use crate::rfcomm::{RfcommSession, RfcommSignal};
use crate::sock::sco;
use crate::sock::OwnedFd;
use crate::worker::{Signal, WorkerHandle};
use crate::Address;

/// `(profile, codec_id)`, mutated only through the codec-switch
/// handshake. Guarded by [`Transport`]'s `type_mtx`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
    A2dpSource,
    A2dpSink,
    HfpHf,
    HfpAg,
    HspHs,
    HspAg,
    None,
}

impl Profile {
    /// `profile-tag` used in object path composition; bit-exact with
    /// the external-interfaces contract.
    pub fn profile_tag(self) -> &'static str {
        match self {
            Profile::A2dpSource => "a2dpsrc",
            Profile::A2dpSink => "a2dpsnk",
            Profile::HfpHf => "hfphf",
            Profile::HfpAg => "hfpag",
            Profile::HspHs => "hsphs",
            Profile::HspAg => "hspag",
            Profile::None => "none",
        }
    }

    fn is_source_side(self) -> bool {
        matches!(self, Profile::A2dpSource | Profile::HfpAg | Profile::HspAg)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodecId {
    A2dp(A2dpCodecId),
    Sco(ScoCodecId),
    None,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportType {
    pub profile: Profile,
    pub codec: CodecId,
}

/// `IDLE → PENDING → ACTIVE → IDLE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum A2dpLinkState {
    Idle = 0,
    Pending = 1,
    Active = 2,
}

impl A2dpLinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => A2dpLinkState::Pending,
            2 => A2dpLinkState::Active,
            _ => A2dpLinkState::Idle,
        }
    }
}

/// The remote-side socket, once acquired. Distinct close behavior per
/// variant (`release_a2dp` just closes; `release_sco` shuts down both
/// directions first), unified behind one `bt_fd`-shaped slot.
enum AcquiredSocket {
    A2dp(OwnedFd),
    Sco(sco::Socket),
}

impl AcquiredSocket {
    fn raw_fd(&self) -> RawFd {
        match self {
            AcquiredSocket::A2dp(fd) => fd.as_raw_fd(),
            AcquiredSocket::Sco(sock) => sock.as_raw_fd(),
        }
    }

    fn close(self) {
        if let AcquiredSocket::Sco(sock) = &self {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        // Dropping either variant closes the underlying fd.
    }
}

/// A2DP-specific fields: codec capability identity, the opaque
/// configuration blob, link state, and the forward/back-channel PCMs.
pub struct A2dpState {
    pub codec: A2dpCodecId,
    configuration: StdMutex<Vec<u8>>,
    capabilities_size: usize,
    link_state: AtomicU8,
    bt_fd_coutq_init: AtomicU16,
    delay: AtomicU16,
    pub pcm: Pcm,
    pub pcm_bc: Pcm,
}

impl A2dpState {
    pub fn state(&self) -> A2dpLinkState {
        A2dpLinkState::from_u8(self.link_state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: A2dpLinkState) {
        self.link_state.store(s as u8, Ordering::SeqCst);
    }

    pub fn configuration(&self) -> Vec<u8> {
        self.configuration.lock().unwrap().clone()
    }

    /// Size in bytes the codec's capability descriptor expects
    /// `configuration` to be; consumed by the codec IO collaborator
    /// when validating a `SetConfiguration` blob, not by this crate.
    pub fn capabilities_size(&self) -> usize {
        self.capabilities_size
    }

    /// Output-queue depth recorded right after `acquire_a2dp` shrank
    /// the send buffer; the codec IO collaborator subtracts the
    /// current `TIOCOUTQ` reading from this to estimate how much of
    /// its own data is still in flight.
    pub fn bt_fd_coutq_init(&self) -> u16 {
        self.bt_fd_coutq_init.load(Ordering::SeqCst)
    }

    /// Per-link additional latency (AVDTP Delay Report), in centibels.
    pub fn delay_cb(&self) -> u16 {
        self.delay.load(Ordering::SeqCst)
    }

    pub fn set_delay_cb(&self, value: u16) {
        self.delay.store(value, Ordering::SeqCst);
    }
}

/// SCO-specific fields: speaker/mic PCMs and the optional RFCOMM
/// session carrying AT commands (absent for a bare HSP AG/HS link with
/// no hands-free control channel).
pub struct ScoState {
    pub spk_pcm: Pcm,
    pub mic_pcm: Pcm,
    pub rfcomm: StdMutex<Option<Arc<dyn RfcommSession>>>,
    /// Guards the codec-switch critical section: release PCMs, release
    /// `bt_fd`, signal the RFCOMM request, wait for completion.
    pub codec_switch_mtx: AsyncMutex<()>,
}

pub enum TransportKind {
    A2dp(A2dpState),
    Sco(ScoState),
}

/// One audio link. The back-reference to `Device` is kept non-owning:
/// back-references are not ownership edges and must not participate in
/// reference counting, or the device graph would never drop.
pub struct Transport {
    device: Weak<Device>,
    pub dbus_owner: String,
    pub dbus_path: String,
    type_mtx: AsyncMutex<TransportType>,
    bt_fd: AsyncMutex<Option<AcquiredSocket>>,
    mtu_read: AtomicU16,
    mtu_write: AtomicU16,
    /// Mutated only under the owning `Device`'s `transports_mutex`.
    ref_count: std::sync::atomic::AtomicUsize,
    pub kind: TransportKind,
    pub thread_enc: WorkerHandle,
    pub thread_dec: WorkerHandle,
    mediator: Arc<dyn MediatorTransport>,
    registrar: Arc<dyn PcmRegistrar>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("dbus_path", &self.dbus_path)
            .field("ref_count", &self.ref_count.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn mtu_read(&self) -> u16 {
        self.mtu_read.load(Ordering::SeqCst)
    }

    pub fn mtu_write(&self) -> u16 {
        self.mtu_write.load(Ordering::SeqCst)
    }

    pub async fn transport_type(&self) -> TransportType {
        *self.type_mtx.lock().await
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn a2dp(&self) -> Result<&A2dpState> {
        match &self.kind {
            TransportKind::A2dp(s) => Ok(s),
            TransportKind::Sco(_) => Err(TransportError::InvalidArg("not an A2DP transport".into())),
        }
    }

    pub fn sco(&self) -> Result<&ScoState> {
        match &self.kind {
            TransportKind::Sco(s) => Ok(s),
            TransportKind::A2dp(_) => Err(TransportError::InvalidArg("not an SCO transport".into())),
        }
    }

    /// `pcms_lock(T)`: locks the canonical PCM pair for this transport's
    /// profile (forward/back-channel for A2DP, speaker/mic for SCO).
    pub fn pcms_lock(&self) -> Result<crate::pcm::PcmsGuard<'_>> {
        match &self.kind {
            TransportKind::A2dp(s) => Ok(pcms_lock(&s.pcm, &s.pcm_bc)),
            TransportKind::Sco(s) => Ok(pcms_lock(&s.spk_pcm, &s.mic_pcm)),
        }
    }

    fn object_path_for(device_path: &str, profile: Profile, mode: PcmMode) -> String {
        let direction = match mode {
            PcmMode::Source => "source",
            PcmMode::Sink => "sink",
        };
        format!("{device_path}/{}/{direction}", profile.profile_tag())
    }
}

// ---------------------------------------------------------------------
// 4.1 Transport factories and destruction
// ---------------------------------------------------------------------

/// `new-a2dp(device, type, owner, path, codec, configuration)`.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(target = "transport", skip(configuration, mediator, registrar))]
pub async fn new_a2dp(
    device: &Arc<Device>,
    profile: Profile,
    owner: String,
    path: String,
    codec: A2dpCodecId,
    capabilities_size: usize,
    configuration: Vec<u8>,
    mediator: Arc<dyn MediatorTransport>,
    registrar: Arc<dyn PcmRegistrar>,
) -> Result<Arc<Transport>> {
    let shape: PcmShape = btd_core::codec::decode_configuration(codec, &configuration)?;

    // Forward PCM ties to the encoder thread on the source role and to
    // the decoder on the sink role; the back-channel PCM takes the
    // other worker.
    let (fwd_role, bc_role, fwd_mode) = match profile {
        Profile::A2dpSource => (WorkerRole::Enc, WorkerRole::Dec, PcmMode::Source),
        Profile::A2dpSink => (WorkerRole::Dec, WorkerRole::Enc, PcmMode::Sink),
        _ => {
            return Err(TransportError::InvalidArg(
                "new_a2dp requires an A2DP profile".into(),
            ))
        }
    };
    let fwd_path = Transport::object_path_for(&path, profile, fwd_mode);
    let bc_mode = match fwd_mode {
        PcmMode::Source => PcmMode::Sink,
        PcmMode::Sink => PcmMode::Source,
    };
    let bc_path = Transport::object_path_for(&path, profile, bc_mode);

    let pcm = Pcm::new(
        fwd_mode,
        fwd_role,
        shape.format,
        shape.channels,
        shape.sampling_hz,
        btd_core::volume::MAX_BT_VOLUME_A2DP,
        fwd_path,
    );
    // The back-channel carries no PCM of its own in the common case
    // (plain A2DP has one direction); it is zero-channel until a
    // FastStream-style codec populates it, and zero-channel PCMs are
    // never registered on the client surface.
    let pcm_bc = Pcm::new(
        bc_mode,
        bc_role,
        shape.format,
        0,
        0,
        btd_core::volume::MAX_BT_VOLUME_A2DP,
        bc_path,
    );

    let a2dp = A2dpState {
        codec,
        configuration: StdMutex::new(configuration),
        capabilities_size,
        link_state: AtomicU8::new(A2dpLinkState::Idle as u8),
        bt_fd_coutq_init: AtomicU16::new(0),
        delay: AtomicU16::new(0),
        pcm,
        pcm_bc,
    };

    let transport = Arc::new(Transport {
        device: Arc::downgrade(device),
        dbus_owner: owner,
        dbus_path: path.clone(),
        type_mtx: AsyncMutex::new(TransportType {
            profile,
            codec: CodecId::A2dp(codec),
        }),
        bt_fd: AsyncMutex::new(None),
        mtu_read: AtomicU16::new(0),
        mtu_write: AtomicU16::new(0),
        ref_count: std::sync::atomic::AtomicUsize::new(1),
        kind: TransportKind::A2dp(a2dp),
        thread_enc: WorkerHandle::new(),
        thread_dec: WorkerHandle::new(),
        mediator,
        registrar,
    });

    device.insert(path, transport.clone());
    if let TransportKind::A2dp(s) = &transport.kind {
        if s.pcm.is_registrable() {
            transport.registrar.register(&s.pcm.dbus_path);
        }
        if s.pcm_bc.is_registrable() {
            transport.registrar.register(&s.pcm_bc.dbus_path);
        }
    }
    Ok(transport)
}

/// `new-sco(device, type, owner, path, rfcomm_fd)`.
#[tracing::instrument(target = "transport", skip(mediator, registrar))]
pub async fn new_sco(
    device: &Arc<Device>,
    profile: Profile,
    owner: String,
    path: String,
    rfcomm_fd: Option<RawFd>,
    mediator: Arc<dyn MediatorTransport>,
    registrar: Arc<dyn PcmRegistrar>,
) -> Result<Arc<Transport>> {
    // HSP has no codec negotiation and adapters lacking eSCO support
    // cannot run mSBC; both cases force CVSD.
    let is_hsp = matches!(profile, Profile::HspHs | Profile::HspAg);
    let codec = if is_hsp || !device.adapter_has_esco() {
        ScoCodecId::Cvsd
    } else {
        ScoCodecId::Undefined
    };
    let shape = btd_core::codec::sco_pcm_shape(codec);

    let spk_path = Transport::object_path_for(&path, profile, PcmMode::Sink);
    let mic_path = Transport::object_path_for(&path, profile, PcmMode::Source);
    let spk_pcm = Pcm::new(
        PcmMode::Sink,
        WorkerRole::Enc,
        shape.format,
        shape.channels,
        shape.sampling_hz,
        btd_core::volume::MAX_BT_VOLUME_SCO,
        spk_path,
    );
    // Transitional layout: both directions are driven by `thread_enc`
    // today; `thread_dec` is reserved so splitting the microphone onto
    // its own worker later is additive, not a breaking change.
    let mic_pcm = Pcm::new(
        PcmMode::Source,
        WorkerRole::Enc,
        shape.format,
        shape.channels,
        shape.sampling_hz,
        btd_core::volume::MAX_BT_VOLUME_SCO,
        mic_path,
    );

    let rfcomm = match rfcomm_fd {
        Some(fd) if fd >= 0 => {
            Some(crate::rfcomm::RawRfcommSession::new(fd).map_err(TransportError::from)?
                as Arc<dyn RfcommSession>)
        }
        _ => None,
    };

    let sco_state = ScoState {
        spk_pcm,
        mic_pcm,
        rfcomm: StdMutex::new(rfcomm),
        codec_switch_mtx: AsyncMutex::new(()),
    };

    let transport = Arc::new(Transport {
        device: Arc::downgrade(device),
        dbus_owner: owner,
        dbus_path: path.clone(),
        type_mtx: AsyncMutex::new(TransportType {
            profile,
            codec: CodecId::Sco(codec),
        }),
        bt_fd: AsyncMutex::new(None),
        mtu_read: AtomicU16::new(0),
        mtu_write: AtomicU16::new(0),
        ref_count: std::sync::atomic::AtomicUsize::new(1),
        kind: TransportKind::Sco(sco_state),
        thread_enc: WorkerHandle::new(),
        thread_dec: WorkerHandle::new(),
        mediator,
        registrar,
    });

    device.insert(path, transport.clone());
    if let TransportKind::Sco(s) = &transport.kind {
        if s.spk_pcm.is_registrable() {
            transport.registrar.register(&s.spk_pcm.dbus_path);
        }
        if s.mic_pcm.is_registrable() {
            transport.registrar.register(&s.mic_pcm.dbus_path);
        }
    }
    Ok(transport)
}

/// `destroy(T)`: the orderly mediator-side tear-down. Unregisters PCMs,
/// destroys any RFCOMM session, cancels both workers synchronously,
/// closes PCM descriptors and releases `bt_fd` under the PCM lock pair,
/// then drops the caller's reference.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn destroy(transport: &Arc<Transport>) {
    match &transport.kind {
        TransportKind::A2dp(s) => {
            transport.registrar.unregister(&s.pcm.dbus_path);
            transport.registrar.unregister(&s.pcm_bc.dbus_path);
        }
        TransportKind::Sco(s) => {
            transport.registrar.unregister(&s.spk_pcm.dbus_path);
            transport.registrar.unregister(&s.mic_pcm.dbus_path);
            if let Some(session) = s.rfcomm.lock().unwrap().take() {
                session.destroy().await;
            }
        }
    }

    transport.thread_enc.cancel().await;
    transport.thread_dec.cancel().await;

    {
        let closed = transport
            .pcms_lock()
            .expect("profile always maps to a pair")
            .close_both();
        if let Err(err) = release_locked(transport, &closed).await {
            tracing::warn!(target: "transport", "release during destroy failed: {err}");
        }
    }

    if let Some(device) = transport.device() {
        device.unref(transport).await;
    }
}

// ---------------------------------------------------------------------
// 4.2 Reference counting
// ---------------------------------------------------------------------

pub fn ref_transport(transport: &Transport) {
    transport.ref_count.fetch_add(1, Ordering::SeqCst);
}

/// `pcm-ref`/`pcm-unref`: thin forwarders, since a PCM has no
/// independent lifetime — keeping a PCM alive means keeping its
/// Transport alive.
pub fn pcm_ref(transport: &Transport) {
    ref_transport(transport);
}

pub async fn pcm_unref(transport: &Arc<Transport>) {
    if let Some(device) = transport.device() {
        device.unref(transport).await;
    }
}

// ---------------------------------------------------------------------
// 4.3 A2DP state machine and acquisition
// ---------------------------------------------------------------------

/// `set-state(T, s)`.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn set_state(transport: &Arc<Transport>, new_state: A2dpLinkState) -> Result<()> {
    let profile = transport.transport_type().await.profile;
    match new_state {
        A2dpLinkState::Pending => {
            if profile == Profile::A2dpSink {
                acquire_a2dp(transport).await?;
            }
        }
        A2dpLinkState::Active => {
            start(transport).await?;
        }
        A2dpLinkState::Idle => {
            stop(transport).await;
        }
    }
    transport.a2dp()?.set_state(new_state);
    Ok(())
}

fn set_sndbuf(fd: &OwnedFd, bytes: i32) -> Result<()> {
    crate::sock::setsockopt(fd, SOL_SOCKET, SO_SNDBUF, &bytes).map_err(TransportError::from)
}

fn read_coutq(fd: &OwnedFd) -> Result<u16> {
    let value: i32 = crate::sock::ioctl_read(fd, TIOCOUTQ).map_err(TransportError::from)?;
    Ok(value as u16)
}

/// `acquire-a2dp`: single-flight under `bt_fd_mtx`. Reuses the existing
/// descriptor on keep-alive; otherwise issues `Acquire`/`TryAcquire` and
/// records the reply.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn acquire_a2dp(transport: &Arc<Transport>) -> Result<(RawFd, u16, u16)> {
    let mut guard = transport.bt_fd.lock().await;
    if let Some(sock) = guard.as_ref() {
        return Ok((sock.raw_fd(), transport.mtu_read(), transport.mtu_write()));
    }
    let state = transport.a2dp()?;
    let mode = if state.state() == A2dpLinkState::Pending {
        AcquireMode::TryAcquire
    } else {
        AcquireMode::Blocking
    };
    let reply = transport
        .mediator
        .acquire(&transport.dbus_path, mode)
        .await
        .map_err(mediator_err)?;
    let fd = unsafe { OwnedFd::new(reply.fd) };
    // Shrink the kernel send buffer to minimise play-out latency, at
    // the cost of tolerating brief write stalls.
    set_sndbuf(&fd, 3 * reply.mtu_write as i32)?;
    let baseline = read_coutq(&fd)?;
    state.bt_fd_coutq_init.store(baseline, Ordering::SeqCst);
    transport.mtu_read.store(reply.mtu_read, Ordering::SeqCst);
    transport.mtu_write.store(reply.mtu_write, Ordering::SeqCst);
    let raw = fd.as_raw_fd();
    *guard = Some(AcquiredSocket::A2dp(fd));
    Ok((raw, reply.mtu_read, reply.mtu_write))
}

fn mediator_err(err: MediatorError) -> TransportError {
    if err.is_benign_on_release() {
        TransportError::MediatorGone
    } else {
        TransportError::Internal(TransportInternalError::Mediator(err.to_string()))
    }
}

/// `release-a2dp`: single-flight under `bt_fd_mtx`, idempotent,
/// absorbs `MediatorGone`. Requires proof (a [`crate::pcm::PcmsClosed`]
/// witness) that the PCM descriptors were already closed under their
/// mutexes before this async call began.
#[tracing::instrument(target = "transport", skip(transport, _pcms))]
pub async fn release_a2dp(
    transport: &Transport,
    _pcms: &crate::pcm::PcmsClosed,
) -> Result<()> {
    let mut guard = transport.bt_fd.lock().await;
    if guard.is_none() {
        return Ok(());
    }
    let state = transport.a2dp()?;
    if state.state() != A2dpLinkState::Idle {
        match transport.mediator.release(&transport.dbus_path).await {
            Ok(()) => {}
            Err(err) if err.is_benign_on_release() => {}
            Err(err) => return Err(mediator_err(err)),
        }
    }
    if let Some(sock) = guard.take() {
        sock.close();
    }
    Ok(())
}

/// `select-codec-a2dp(T, sep)`: succeeds immediately if `configuration`
/// and `codec_id` already match; otherwise requests `SetConfiguration`
/// and relies on a later mediator callback to drive the state change.
#[tracing::instrument(target = "transport", skip(transport, configuration))]
pub async fn select_codec_a2dp(
    transport: &Transport,
    codec: A2dpCodecId,
    configuration: &[u8],
) -> Result<()> {
    let state = transport.a2dp()?;
    if state.codec == codec && state.configuration() == configuration {
        return Ok(());
    }
    transport
        .mediator
        .set_configuration(&transport.dbus_path, configuration)
        .await
        .map_err(mediator_err)?;
    Ok(())
}

// ---------------------------------------------------------------------
// 4.4 SCO acquisition, release, codec switch
// ---------------------------------------------------------------------

fn voice_setting_for(codec: ScoCodecId) -> VoiceSetting {
    match codec {
        ScoCodecId::Msbc => VoiceSetting::Transparent,
        _ => VoiceSetting::Cvsd16Bit,
    }
}

/// `acquire-sco`: opens a raw HCI SCO socket, connects it with the
/// negotiated voice setting, records the kernel-reported MTU as both
/// read and write MTU.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn acquire_sco(transport: &Arc<Transport>, dev_id: u16, addr: Address) -> Result<RawFd> {
    let mut guard = transport.bt_fd.lock().await;
    if let Some(sock) = guard.as_ref() {
        return Ok(sock.raw_fd());
    }
    let ty = transport.transport_type().await;
    let codec = match ty.codec {
        CodecId::Sco(c) => c,
        _ => return Err(TransportError::InvalidArg("not an SCO transport".into())),
    };
    let socket = hci::sco_open(dev_id).map_err(TransportError::from)?;
    if let Err(err) = hci::sco_connect(&socket, addr, voice_setting_for(codec)).await {
        return Err(TransportError::from(err));
    }
    let mtu = hci::sco_mtu(&socket).map_err(TransportError::from)?;
    transport.mtu_read.store(mtu, Ordering::SeqCst);
    transport.mtu_write.store(mtu, Ordering::SeqCst);
    let raw = socket.as_raw_fd();
    *guard = Some(AcquiredSocket::Sco(socket));
    Ok(raw)
}

/// `release-sco`: `shutdown(RDWR)` then close.
#[tracing::instrument(target = "transport", skip(transport, _pcms))]
pub async fn release_sco(transport: &Transport, _pcms: &crate::pcm::PcmsClosed) -> Result<()> {
    let mut guard = transport.bt_fd.lock().await;
    if let Some(sock) = guard.take() {
        sock.close();
    }
    Ok(())
}

/// Locks the PCM pair itself, closes both descriptors, then releases.
/// Only safe to call where the caller is not already holding that
/// transport's PCM mutexes (the std-mutex pair `pcms_lock` guards is not
/// reentrant) — used by the bare `unref` fallback path, which reaches
/// zero without having gone through `destroy`'s explicit PCM-pair
/// critical section.
async fn release(transport: &Transport) -> Result<()> {
    let closed = transport.pcms_lock()?.close_both();
    release_locked(transport, &closed).await
}

/// Releases `bt_fd` given proof the PCM pair was already closed under
/// lock. Used by `destroy` and worker cleanup, which lock the pair
/// themselves (to close the PCM descriptors) immediately before
/// releasing. Takes [`crate::pcm::PcmsClosed`], not a live `PcmsGuard`:
/// the guard's `std::sync::MutexGuard`s are `!Send` and must not be held
/// across this function's `.await` points.
async fn release_locked(transport: &Transport, pcms: &crate::pcm::PcmsClosed) -> Result<()> {
    match &transport.kind {
        TransportKind::A2dp(_) => release_a2dp(transport, pcms).await,
        TransportKind::Sco(_) => release_sco(transport, pcms).await,
    }
}

/// `select-codec-sco(T, codec_id)`: HFP only. Under `type_mtx`: if
/// already at `codec_id`, succeed. Otherwise, holding the RFCOMM
/// completion mutex, release both PCMs then the socket, send the
/// matching `SET_CODEC_*` signal, wait for completion, and verify the
/// codec actually changed.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn select_codec_sco(transport: &Arc<Transport>, codec: ScoCodecId) -> Result<()> {
    {
        let ty_guard = transport.type_mtx.lock().await;
        if !matches!(ty_guard.profile, Profile::HfpHf | Profile::HfpAg) {
            return Err(TransportError::NotSupported);
        }
        if ty_guard.codec == CodecId::Sco(codec) {
            return Ok(());
        }
        // `type_mtx` is dropped here: the RFCOMM round trip can take an
        // unbounded time and must not hold up every other reader of
        // `transport_type()` while it waits. `codec_switch_mtx` below is
        // what actually serialises concurrent switch attempts.
    }

    let state = transport.sco()?;
    let _switch_guard = state.codec_switch_mtx.lock().await;
    let session = state
        .rfcomm
        .lock()
        .unwrap()
        .clone()
        .ok_or(TransportError::NotSupported)?;

    let completed = session.codec_selection_completed();
    // Register as a waiter before sending the signal: `notify_waiters`
    // only wakes waiters already registered at the time it is called,
    // so subscribing first is what makes this race-free against a
    // same-task-scheduled notifier (a real RFCOMM peer ack normally
    // arrives much later than this, but nothing should depend on that).
    let notified = completed.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    {
        let closed = transport.pcms_lock()?.close_both();
        release_sco(transport, &closed).await?;
    }

    let signal = match codec {
        ScoCodecId::Cvsd => RfcommSignal::HfpSetCodecCvsd,
        ScoCodecId::Msbc => RfcommSignal::HfpSetCodecMsbc,
        ScoCodecId::Undefined => return Err(TransportError::NotSupported),
    };
    session
        .send_signal(signal)
        .await
        .map_err(|err| TransportError::Io(TransportInternalError::Io {
            kind: std::io::ErrorKind::Other,
            message: err.to_string(),
        }))?;

    notified.await;

    let ty_guard = transport.type_mtx.lock().await;
    if ty_guard.codec == CodecId::Sco(codec) {
        Ok(())
    } else {
        Err(TransportError::Io(TransportInternalError::Io {
            kind: std::io::ErrorKind::Other,
            message: "codec selection completed without the expected codec".into(),
        }))
    }
}

/// Invoked by the RFCOMM collaborator once it has actually observed the
/// peer's codec acknowledgement; updates the authoritative `type.codec`
/// before waking anyone blocked in `select_codec_sco`.
pub async fn apply_negotiated_codec(transport: &Transport, codec: ScoCodecId) {
    let mut ty = transport.type_mtx.lock().await;
    ty.codec = CodecId::Sco(codec);
}

// ---------------------------------------------------------------------
// 4.5 Worker threads: start/stop
// ---------------------------------------------------------------------

/// `start(T)`: starts whichever worker(s) the profile requires. A2DP
/// uses the codec-specific source/sink pair; SCO uses a single worker
/// attached to `thread_enc`.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn start(transport: &Arc<Transport>) -> Result<()> {
    match &transport.kind {
        TransportKind::A2dp(_) => {
            let t1 = transport.clone();
            transport
                .thread_enc
                .create("a2dp-enc", move |rx, ready| worker_body(t1, WorkerRole::Enc, rx, ready))
                .await?;
            let t2 = transport.clone();
            transport
                .thread_dec
                .create("a2dp-dec", move |rx, ready| worker_body(t2, WorkerRole::Dec, rx, ready))
                .await?;
        }
        TransportKind::Sco(_) => {
            let t1 = transport.clone();
            transport
                .thread_enc
                .create("sco-io", move |rx, ready| worker_body(t1, WorkerRole::Enc, rx, ready))
                .await?;
        }
    }
    Ok(())
}

/// `stop(T)`: cancels both handles.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn stop(transport: &Arc<Transport>) {
    transport.thread_enc.cancel().await;
    transport.thread_dec.cancel().await;
}

/// The IO worker's body. The actual codec encode/decode loop is an
/// external collaborator (out of scope for this crate); what lives
/// here is the control-signal multiplexing and the mandatory cleanup
/// sequence every terminal path (including `abort()`) must run.
async fn worker_body(
    transport: Arc<Transport>,
    role: WorkerRole,
    mut rx: tokio::sync::mpsc::Receiver<Signal>,
    ready: std::sync::Arc<tokio::sync::Notify>,
) {
    // Taking a reference here mirrors `create(Th, ...)` taking a fresh
    // reference on `T` before spawning; it is released by the cleanup
    // sequence below on every terminal path.
    ref_transport(&transport);
    let cleanup = crate::worker::WorkerCleanupGuard::new(transport.clone(), |transport| {
        tokio::spawn(async move {
            if let Ok(guard) = transport.pcms_lock() {
                let closed = guard.close_both();
                let _ = release_locked(&transport, &closed).await;
            }
            if let Some(device) = transport.device() {
                device.unref(&transport).await;
            }
        });
    });

    crate::worker::ready(&ready).await;

    loop {
        match rx.recv().await {
            Some(Signal::PcmSync) => {
                let pcm = match &transport.kind {
                    TransportKind::A2dp(s) if s.pcm.role == role => &s.pcm,
                    TransportKind::A2dp(s) => &s.pcm_bc,
                    TransportKind::Sco(s) => &s.spk_pcm,
                };
                pcm.notify_synced();
            }
            Some(_other) => {
                // PCM open/close/pause/resume/drop and HFP codec
                // signals are dispatched by the codec IO collaborator
                // this worker hosts; multiplexing them onto it is out
                // of this crate's scope.
            }
            None => break,
        }
    }

    // Cooperative exit: run the release sequence inline and awaited so
    // it has definitely finished by the time this task completes, and
    // therefore by the time `WorkerHandle::cancel`'s join resolves.
    let transport = cleanup.disarm();
    if let Ok(guard) = transport.pcms_lock() {
        let closed = guard.close_both();
        let _ = release_locked(&transport, &closed).await;
    }
    if let Some(device) = transport.device() {
        device.unref(&transport).await;
    }
}

// ---------------------------------------------------------------------
// 4.7 Volume translation and propagation
// ---------------------------------------------------------------------

/// `volume-update(P)`.
#[tracing::instrument(target = "transport", skip(transport))]
pub async fn volume_update(transport: &Transport, pcm: &Pcm) -> Result<()> {
    let ty = transport.transport_type().await;
    let skip_remote = pcm.soft_volume && ty.profile.is_source_side();
    if !skip_remote {
        match &transport.kind {
            TransportKind::A2dp(_) => {
                let bt = pcm.bt_volume();
                if let Err(err) = transport
                    .mediator
                    .set_volume(&transport.dbus_path, &transport.dbus_owner, bt)
                    .await
                {
                    tracing::warn!(target: "transport", "volume property set failed: {err}");
                }
            }
            TransportKind::Sco(s) => {
                if let Some(session) = s.rfcomm.lock().unwrap().clone() {
                    let bt = pcm.bt_volume();
                    if let Err(err) = session.send_signal(RfcommSignal::UpdateVolume(bt)).await {
                        tracing::warn!(target: "transport", "rfcomm volume update failed: {err}");
                    }
                }
            }
        }
    }
    transport
        .registrar
        .update(&pcm.dbus_path, PcmUpdateMask::Volume)
        .await;
    Ok(())
}

// ---------------------------------------------------------------------
// Device: remote peer, owner of the transport map.
// ---------------------------------------------------------------------

/// A remote Bluetooth peer. Owns the mapping from mediator object path
/// to [`Transport`] and the mutex guarding that map and every
/// transport's reference count beneath it.
pub struct Device {
    adapter: Weak<crate::device::Adapter>,
    pub address: Address,
    adapter_id: u16,
    adapter_has_esco: bool,
    transports: StdMutex<HashMap<String, Arc<Transport>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(
        adapter: &Arc<crate::device::Adapter>,
        address: Address,
        adapter_id: u16,
        adapter_has_esco: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter: Arc::downgrade(adapter),
            address,
            adapter_id,
            adapter_has_esco,
            transports: StdMutex::new(HashMap::new()),
        })
    }

    pub fn adapter(&self) -> Option<Arc<crate::device::Adapter>> {
        self.adapter.upgrade()
    }

    pub fn adapter_id(&self) -> u16 {
        self.adapter_id
    }

    pub fn adapter_has_esco(&self) -> bool {
        self.adapter_has_esco
    }

    fn insert(&self, path: String, transport: Arc<Transport>) {
        self.transports.lock().unwrap().insert(path, transport);
    }

    /// `lookup(device, path)`: returns a handle with an already
    /// incremented ref count, or `None` if absent.
    pub fn lookup(&self, path: &str) -> Option<Arc<Transport>> {
        let map = self.transports.lock().unwrap();
        let transport = map.get(path)?;
        ref_transport(transport);
        Some(transport.clone())
    }

    /// `unref`: decrements under the map mutex; on zero, steals the
    /// transport out of the map before dropping the mutex, then tears
    /// down subsidiary resources outside the lock so no concurrent
    /// `lookup` can resurrect a zero-count transport.
    pub async fn unref(&self, transport: &Arc<Transport>) {
        let stolen = {
            let mut map = self.transports.lock().unwrap();
            let prev = transport.ref_count.fetch_sub(1, Ordering::SeqCst);
            if prev == 1 {
                map.remove(&transport.dbus_path)
            } else {
                None
            }
        };
        if let Some(transport) = stolen {
            // Reverse order of construction: close bt_fd (if somehow
            // still open), drop codec-specific storage and PCMs, let
            // the thread handles drop. `destroy` already performs the
            // controlled version of this for the mediator-driven path;
            // this covers a transport that reached ref_count==0 via a
            // bare `unref` without an explicit `destroy` call.
            let _ = release(&transport).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::AcquireReply;
    use crate::registrar::EventPcmRegistrar;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct FakeMediator {
        acquire_calls: AtomicUsize,
    }

    #[async_trait]
    impl MediatorTransport for FakeMediator {
        async fn acquire(&self, _path: &str, _mode: AcquireMode) -> std::result::Result<AcquireReply, MediatorError> {
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            // Duplicate stdin (fd 0) so we have a real, always-valid fd
            // to exercise sndbuf/coutq without opening a socket.
            let fd = unsafe { libc::dup(0) };
            Ok(AcquireReply {
                fd,
                mtu_read: 672,
                mtu_write: 679,
            })
        }

        async fn release(&self, _path: &str) -> std::result::Result<(), MediatorError> {
            Ok(())
        }

        async fn set_configuration(&self, _path: &str, _configuration: &[u8]) -> std::result::Result<(), MediatorError> {
            Ok(())
        }

        async fn set_volume(&self, _path: &str, _owner: &str, _volume: u16) -> std::result::Result<(), MediatorError> {
            Ok(())
        }
    }

    fn make_registrar() -> Arc<dyn PcmRegistrar> {
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(EventPcmRegistrar::new(tx))
    }

    async fn make_a2dp_device() -> (Arc<crate::device::Adapter>, Arc<Device>) {
        let adapter = crate::device::Adapter::new_detached(0, true);
        let device = Device::new(&adapter, Address::any(), 0, true);
        adapter.insert_device_for_test(device.clone());
        (adapter, device)
    }

    #[tokio::test]
    async fn scenario_keep_alive_acquire() {
        let (_adapter, device) = make_a2dp_device().await;
        let mediator: Arc<dyn MediatorTransport> = Arc::new(FakeMediator::default());
        let transport = new_a2dp(
            &device,
            Profile::A2dpSink,
            "org.bluez".into(),
            "/org/bluez/hci0/dev_AA/fd0".into(),
            A2dpCodecId::Sbc,
            4,
            vec![(0x08u8 << 4) | 0x04],
            mediator.clone(),
            make_registrar(),
        )
        .await
        .unwrap();

        set_state(&transport, A2dpLinkState::Pending).await.unwrap();
        let (fd1, _, mtu_write) = acquire_a2dp(&transport).await.unwrap();
        assert_eq!(mtu_write, 679);

        let (fd2, _, _) = acquire_a2dp(&transport).await.unwrap();
        assert_eq!(fd1, fd2, "keep-alive must return the existing descriptor");

        unsafe {
            libc::close(fd1);
        }
    }

    #[tokio::test]
    async fn scenario_unref_freeing() {
        let (_adapter, device) = make_a2dp_device().await;
        let mediator: Arc<dyn MediatorTransport> = Arc::new(FakeMediator::default());
        let path = "/org/bluez/hci0/dev_AA/fd1".to_string();
        let transport = new_a2dp(
            &device,
            Profile::A2dpSource,
            "org.bluez".into(),
            path.clone(),
            A2dpCodecId::Sbc,
            4,
            vec![(0x08u8 << 4) | 0x04],
            mediator,
            make_registrar(),
        )
        .await
        .unwrap();
        assert_eq!(transport.ref_count(), 1);

        let looked_up = device.lookup(&path).expect("present after construction");
        assert_eq!(transport.ref_count(), 2);

        device.unref(&looked_up).await;
        assert_eq!(transport.ref_count(), 1);
        assert!(device.lookup(&path).is_some());

        device.unref(&transport).await;
        assert!(device.lookup(&path).is_none());
    }

    #[tokio::test]
    async fn scenario_destroy_under_load() {
        let (_adapter, device) = make_a2dp_device().await;
        let mediator: Arc<dyn MediatorTransport> = Arc::new(FakeMediator::default());
        let path = "/org/bluez/hci0/dev_AA/fd2".to_string();
        let transport = new_a2dp(
            &device,
            Profile::A2dpSink,
            "org.bluez".into(),
            path.clone(),
            A2dpCodecId::Sbc,
            4,
            vec![(0x08u8 << 4) | 0x04],
            mediator,
            make_registrar(),
        )
        .await
        .unwrap();

        // Bring the link up: acquire the socket and start both worker
        // tasks, so `destroy` below has to tear down live workers, not
        // idle ones.
        set_state(&transport, A2dpLinkState::Pending).await.unwrap();
        set_state(&transport, A2dpLinkState::Active).await.unwrap();
        assert!(transport.thread_enc.is_running().await);
        assert!(transport.thread_dec.is_running().await);

        let a2dp = transport.a2dp().unwrap();
        assert!(a2dp.pcm.fd().is_some());

        destroy(&transport).await;

        // By the time `destroy` returns, the worker release sequence
        // must have already run: no worker left running, both PCM fds
        // closed, and the transport gone from the device map. None of
        // this should depend on a detached cleanup task happening to
        // have been scheduled by now.
        assert!(!transport.thread_enc.is_running().await);
        assert!(!transport.thread_dec.is_running().await);
        assert!(a2dp.pcm.fd().is_none());
        assert!(a2dp.pcm_bc.fd().is_none());
        assert!(device.lookup(&path).is_none());
    }

    #[tokio::test]
    async fn sco_codec_switch_happy_path() {
        struct FakeRfcomm {
            completed: Arc<tokio::sync::Notify>,
            sent: std::sync::Mutex<Vec<RfcommSignal>>,
        }
        #[async_trait]
        impl RfcommSession for FakeRfcomm {
            async fn send_signal(&self, signal: RfcommSignal) -> std::result::Result<(), crate::rfcomm::RfcommError> {
                self.sent.lock().unwrap().push(signal);
                self.completed.notify_waiters();
                Ok(())
            }
            async fn destroy(&self) {}
            fn codec_selection_completed(&self) -> Arc<tokio::sync::Notify> {
                self.completed.clone()
            }
        }

        let (_adapter, device) = make_a2dp_device().await;
        let mediator: Arc<dyn MediatorTransport> = Arc::new(FakeMediator::default());
        let transport = new_sco(
            &device,
            Profile::HfpAg,
            "org.bluez".into(),
            "/org/bluez/hci0/dev_AA/sco0".into(),
            None,
            mediator,
            make_registrar(),
        )
        .await
        .unwrap();

        let fake_rfcomm = Arc::new(FakeRfcomm {
            completed: Arc::new(tokio::sync::Notify::new()),
            sent: std::sync::Mutex::new(vec![]),
        });
        if let TransportKind::Sco(s) = &transport.kind {
            *s.rfcomm.lock().unwrap() = Some(fake_rfcomm.clone() as Arc<dyn RfcommSession>);
        }

        // Simulate the RFCOMM collaborator applying the negotiated
        // codec concurrently with the notification it sends.
        let t2 = transport.clone();
        tokio::spawn(async move {
            apply_negotiated_codec(&t2, ScoCodecId::Msbc).await;
        });

        select_codec_sco(&transport, ScoCodecId::Msbc).await.unwrap();
        assert_eq!(
            fake_rfcomm.sent.lock().unwrap().clone(),
            vec![RfcommSignal::HfpSetCodecMsbc]
        );
    }

    #[tokio::test]
    async fn sco_codec_switch_failure_leaves_no_dangling_locks() {
        struct StaleRfcomm {
            completed: Arc<tokio::sync::Notify>,
        }
        #[async_trait]
        impl RfcommSession for StaleRfcomm {
            async fn send_signal(&self, _signal: RfcommSignal) -> std::result::Result<(), crate::rfcomm::RfcommError> {
                self.completed.notify_waiters();
                Ok(())
            }
            async fn destroy(&self) {}
            fn codec_selection_completed(&self) -> Arc<tokio::sync::Notify> {
                self.completed.clone()
            }
        }

        let (_adapter, device) = make_a2dp_device().await;
        let mediator: Arc<dyn MediatorTransport> = Arc::new(FakeMediator::default());
        let transport = new_sco(
            &device,
            Profile::HfpHf,
            "org.bluez".into(),
            "/org/bluez/hci0/dev_AA/sco1".into(),
            None,
            mediator,
            make_registrar(),
        )
        .await
        .unwrap();
        if let TransportKind::Sco(s) = &transport.kind {
            *s.rfcomm.lock().unwrap() = Some(Arc::new(StaleRfcomm {
                completed: Arc::new(tokio::sync::Notify::new()),
            }) as Arc<dyn RfcommSession>);
        }

        let err = select_codec_sco(&transport, ScoCodecId::Msbc)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));

        // The transport must still be releasable: acquiring the
        // type_mtx and PCM pair again must not deadlock.
        let _ty = transport.transport_type().await;
        let pcms = transport.pcms_lock().unwrap();
        drop(pcms);
    }
}
