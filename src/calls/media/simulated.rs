use super::endpoint::{CaptureDevices, DeviceRelease, MediaTrack};
use async_trait::async_trait;
use callcore::{CallError, TrackInfo, TrackKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct DeviceCounters {
    permission_denied: AtomicBool,
    microphone_missing: AtomicBool,
    camera_missing: AtomicBool,
    open_delay_ms: AtomicU64,
    next_id: AtomicU64,
    opened: AtomicUsize,
    live: AtomicUsize,
    stops: AtomicUsize,
}

impl DeviceRelease for DeviceCounters {
    fn release(&self, _track: &TrackInfo) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.stops.fetch_add(1, Ordering::AcqRel);
    }
}

/// In-process capture devices that count what is held.
///
/// Clones share the same counters.
#[derive(Clone, Default)]
pub struct SimulatedDevices {
    inner: Arc<DeviceCounters>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` fail as if the user declined the prompt.
    pub fn deny_permission(&self, denied: bool) {
        self.inner.permission_denied.store(denied, Ordering::Release);
    }

    pub fn set_microphone_present(&self, present: bool) {
        self.inner
            .microphone_missing
            .store(!present, Ordering::Release);
    }

    pub fn set_camera_present(&self, present: bool) {
        self.inner.camera_missing.store(!present, Ordering::Release);
    }

    /// Delay each `open`, like a permission prompt waiting on the user.
    pub fn set_open_delay(&self, delay: Duration) {
        self.inner
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Tracks opened and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::Acquire)
    }

    /// Number of times a device was switched off.
    pub fn device_stops(&self) -> usize {
        self.inner.stops.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CaptureDevices for SimulatedDevices {
    async fn open(&self, kind: TrackKind) -> Result<MediaTrack, CallError> {
        let delay = self.inner.open_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let (missing, label) = match kind {
            TrackKind::Audio => (&self.inner.microphone_missing, "Simulated Microphone"),
            TrackKind::Video => (&self.inner.camera_missing, "Simulated Camera"),
        };
        if self.inner.permission_denied.load(Ordering::Acquire) {
            return Err(CallError::MediaPermissionDenied(format!(
                "{} access was declined",
                label
            )));
        }
        if missing.load(Ordering::Acquire) {
            return Err(CallError::MediaUnavailable(format!("no {} found", label)));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        self.inner.opened.fetch_add(1, Ordering::AcqRel);
        self.inner.live.fetch_add(1, Ordering::AcqRel);

        let info = TrackInfo {
            id: format!("sim-{:?}-{}", kind, id).to_lowercase(),
            kind,
            label: label.to_string(),
        };
        let device: Arc<dyn DeviceRelease> = self.inner.clone();
        Ok(MediaTrack::new(info, device))
    }
}
