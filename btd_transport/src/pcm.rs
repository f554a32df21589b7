//! PCM endpoints: one direction of sample flow between the daemon and a
//! local client.

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use btd_core::codec::SampleFormat;
use btd_core::volume;

use crate::error::{Result, TransportError};
use crate::worker::{Signal, WorkerHandle};

/// The worker-side role driving a PCM endpoint: matches `thread_enc`
/// (source-side outbound encoding) vs. `thread_dec` (sink-side inbound
/// decoding). SCO's transitional layout attaches both endpoints to
/// `Enc` (see [`crate::transport::TransportKind::Sco`]).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerRole {
    Enc,
    Dec,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PcmMode {
    Source,
    Sink,
}

/// An explicitly muted channel's averaged level is clamped to 0 cB
/// before translation, per the volume-update propagation rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelVolume {
    pub level: i32,
    pub muted: bool,
}

/// Fixed post-drain settle delay: the mediator exposes no drain-complete
/// signal, so this is the only available proxy for "the remote output
/// buffer has actually emptied." Kept as a named, unexplained constant
/// rather than derived from MTU/sample-rate math, since there is no
/// observable invariant it's actually tied to.
pub const POST_DRAIN_SETTLE: Duration = Duration::from_millis(200);

struct PcmState {
    fd: Option<RawFd>,
}

pub struct Pcm {
    pub mode: PcmMode,
    pub role: WorkerRole,
    pub format: SampleFormat,
    pub channels: u8,
    pub sampling_hz: u32,
    pub max_bt_volume: u16,
    pub soft_volume: bool,
    pub delay_cb: i32,
    pub dbus_path: String,
    state: Mutex<PcmState>,
    volume: Mutex<[ChannelVolume; 2]>,
    synced: Notify,
}

impl std::fmt::Debug for Pcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pcm")
            .field("mode", &self.mode)
            .field("role", &self.role)
            .field("dbus_path", &self.dbus_path)
            .finish_non_exhaustive()
    }
}

impl Pcm {
    pub fn new(
        mode: PcmMode,
        role: WorkerRole,
        format: SampleFormat,
        channels: u8,
        sampling_hz: u32,
        max_bt_volume: u16,
        dbus_path: String,
    ) -> Self {
        Self {
            mode,
            role,
            format,
            channels,
            sampling_hz,
            max_bt_volume,
            soft_volume: false,
            delay_cb: 0,
            dbus_path,
            state: Mutex::new(PcmState { fd: None }),
            volume: Mutex::new([ChannelVolume::default(); 2]),
            synced: Notify::new(),
        }
    }

    /// Endpoints with zero channels (e.g. an unused FastStream voice
    /// side) are never registered on the client-facing surface.
    pub fn is_registrable(&self) -> bool {
        self.channels > 0
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.state.lock().unwrap().fd
    }

    pub fn set_fd(&self, fd: Option<RawFd>) {
        self.state.lock().unwrap().fd = fd;
    }

    /// `pcm-release(P)`: closes `P.fd` under `P.mutex`.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(fd) = state.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }

    pub fn volumes(&self) -> [ChannelVolume; 2] {
        *self.volume.lock().unwrap()
    }

    pub fn set_volume(&self, channel: usize, value: ChannelVolume) {
        self.volume.lock().unwrap()[channel] = value;
    }

    /// Average level across channels for remote propagation, forced to
    /// silence if either channel is muted.
    pub fn average_level(&self) -> i32 {
        let v = self.volumes();
        volume::average_level([v[0].level, v[1].level], [v[0].muted, v[1].muted])
    }

    /// Translate the averaged level into a Bluetooth volume unit.
    pub fn bt_volume(&self) -> u16 {
        volume::level_to_bt(self.average_level(), self.max_bt_volume)
    }

    /// Signals a drain completion; called by the IO worker once it has
    /// flushed everything queued ahead of a `PCM_SYNC` signal.
    pub fn notify_synced(&self) {
        self.synced.notify_one();
    }

    async fn wait_synced(&self) {
        self.synced.notified().await;
    }
}

/// `pcm-pause/resume/drop(P)`: enqueue the matching signal on the
/// worker driving `pcm`. `drop` always targets the encoder, regardless
/// of which role drives `pcm`, since the encoder owns outbound buffer
/// flushes.
pub async fn pcm_pause(worker: &WorkerHandle) -> Result<()> {
    worker.send(Signal::PcmPause).await
}

pub async fn pcm_resume(worker: &WorkerHandle) -> Result<()> {
    worker.send(Signal::PcmResume).await
}

pub async fn pcm_drop(thread_enc: &WorkerHandle) -> Result<()> {
    thread_enc.send(Signal::PcmDrop).await
}

/// `pcm-drain(P)`: blocks the caller until the IO worker signals
/// `synced`, then waits out [`POST_DRAIN_SETTLE`] before returning.
/// Refuses with `NoThread` if no worker is currently driving `pcm`.
pub async fn pcm_drain(pcm: &Pcm, worker: &WorkerHandle) -> Result<()> {
    if !worker.is_running().await {
        return Err(TransportError::NoThread);
    }
    worker.send(Signal::PcmSync).await?;
    pcm.wait_synced().await;
    tokio::time::sleep(POST_DRAIN_SETTLE).await;
    Ok(())
}

/// Witness that both of a transport's PCM mutexes are held, in the
/// canonical pair order. This is the only sanctioned way to touch both
/// PCM descriptors of a transport at once.
///
/// This type holds `std::sync::MutexGuard`s, which are `!Send`; it must
/// never be kept alive across an `.await` point (the lock pair is only
/// ever held for the synchronous span of closing the descriptors). Code
/// that needs to prove the descriptors were closed under lock *and* then
/// go on to `.await` (e.g. the async mediator `Release` call) must use
/// [`PcmsClosed`] instead, obtained by consuming this guard via
/// [`PcmsGuard::close_both`].
pub struct PcmsGuard<'a> {
    first: std::sync::MutexGuard<'a, PcmState>,
    second: std::sync::MutexGuard<'a, PcmState>,
}

/// Proof that both of a transport's PCM descriptors were closed while
/// both PCM mutexes were held, produced only by consuming a
/// [`PcmsGuard`]. Zero-sized and `Send`, so — unlike `PcmsGuard` itself —
/// it can be held across an `.await` by `release_a2dp`/`release_sco`
/// without making their caller's future `!Send`.
#[derive(Clone, Copy)]
pub struct PcmsClosed(());

impl<'a> PcmsGuard<'a> {
    /// Closes both descriptors while still holding both locks, then
    /// drops the locks (consuming `self`) and returns a witness that the
    /// close already happened under them.
    pub fn close_both(mut self) -> PcmsClosed {
        if let Some(fd) = self.first.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(fd) = self.second.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        PcmsClosed(())
    }
}

/// `pcms_lock(T)`: acquires both PCM mutexes of a transport in the
/// canonical pair order (forward before back-channel for A2DP; speaker
/// before microphone for SCO). Both locks are released together when
/// the returned guard is dropped (`pcms_unlock`), so there is no
/// separate unlock call to forget.
pub fn pcms_lock<'a>(first: &'a Pcm, second: &'a Pcm) -> PcmsGuard<'a> {
    let first_state = first.state.lock().unwrap();
    let second_state = second.state.lock().unwrap();
    PcmsGuard {
        first: first_state,
        second: second_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_channel_pcm_is_not_registrable() {
        let pcm = Pcm::new(
            PcmMode::Source,
            WorkerRole::Enc,
            SampleFormat::S16_2Le,
            0,
            0,
            127,
            "/dev/a2dpsrc/source".into(),
        );
        assert!(!pcm.is_registrable());
    }

    #[test]
    fn muted_channel_forces_silence() {
        let pcm = Pcm::new(
            PcmMode::Sink,
            WorkerRole::Dec,
            SampleFormat::S16_2Le,
            2,
            44_100,
            127,
            "/dev/a2dpsnk/sink".into(),
        );
        pcm.set_volume(0, ChannelVolume { level: 5000, muted: false });
        pcm.set_volume(1, ChannelVolume { level: 5000, muted: true });
        assert_eq!(pcm.average_level(), 0);
        assert_eq!(pcm.bt_volume(), 0);
    }

    #[tokio::test]
    async fn drain_without_worker_is_refused() {
        let worker = WorkerHandle::new();
        let pcm = Pcm::new(
            PcmMode::Source,
            WorkerRole::Enc,
            SampleFormat::S16_2Le,
            2,
            44_100,
            127,
            "/dev/a2dpsrc/source".into(),
        );
        let err = pcm_drain(&pcm, &worker).await.unwrap_err();
        assert!(matches!(err, TransportError::NoThread));
    }
}
