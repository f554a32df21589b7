//! Client-facing PCM registrar: notifies external observers when a PCM
//! endpoint's client-visible properties change (today: volume).
//!
//! Built on the same subscribe/notify fan-out the rest of the workspace
//! uses for client-observable events.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use btd_shared::event::{self, SubscriptionReq};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PcmUpdateMask {
    Volume,
}

#[derive(Clone, Debug)]
pub struct PcmEvent {
    pub path: String,
    pub mask: PcmUpdateMask,
}

event::setup_event!(PcmEvent);

#[async_trait]
pub trait PcmRegistrar: Send + Sync {
    fn register(&self, path: &str);
    fn unregister(&self, path: &str);
    async fn update(&self, path: &str, mask: PcmUpdateMask);
}

/// Default registrar: tracks which paths are currently registered (so a
/// stray `update` for an unregistered/unregistered-since PCM is a
/// no-op) and fans `update` out through the shared event channel.
pub struct EventPcmRegistrar {
    registered: Mutex<HashSet<String>>,
    msg_tx: mpsc::Sender<PcmEvent>,
}

impl EventPcmRegistrar {
    pub fn new(msg_tx: mpsc::Sender<PcmEvent>) -> Self {
        Self {
            registered: Mutex::new(HashSet::new()),
            msg_tx,
        }
    }
}

#[async_trait]
impl PcmRegistrar for EventPcmRegistrar {
    fn register(&self, path: &str) {
        self.registered.lock().unwrap().insert(path.to_owned());
    }

    fn unregister(&self, path: &str) {
        self.registered.lock().unwrap().remove(path);
    }

    async fn update(&self, path: &str, mask: PcmUpdateMask) {
        if !self.registered.lock().unwrap().contains(path) {
            return;
        }
        let _ = self
            .msg_tx
            .send(PcmEvent {
                path: path.to_owned(),
                mask,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_for_unregistered_path_is_a_no_op() {
        let (tx, mut rx) = mpsc::channel(4);
        let registrar = EventPcmRegistrar::new(tx);

        registrar.update("/pcm/never-registered", PcmUpdateMask::Volume).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_after_unregister_is_a_no_op() {
        let (tx, mut rx) = mpsc::channel(4);
        let registrar = EventPcmRegistrar::new(tx);

        registrar.register("/pcm/0");
        registrar.unregister("/pcm/0");
        registrar.update("/pcm/0", PcmUpdateMask::Volume).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_for_registered_path_fans_out() {
        let (tx, mut rx) = mpsc::channel(4);
        let registrar = EventPcmRegistrar::new(tx);

        registrar.register("/pcm/0");
        registrar.update("/pcm/0", PcmUpdateMask::Volume).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.path, "/pcm/0");
        assert_eq!(event.mask, PcmUpdateMask::Volume);
    }
}
