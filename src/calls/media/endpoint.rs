use async_trait::async_trait;
use callcore::{CallError, MediaKind, TrackInfo, TrackKind};
use log::{debug, info};
use scopeguard::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Opens capture devices on the host platform.
///
/// `open` may suspend indefinitely while a permission prompt is shown.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn open(&self, kind: TrackKind) -> Result<MediaTrack, CallError>;
}

/// Called exactly once when a track is stopped, to switch the device off.
pub trait DeviceRelease: Send + Sync {
    fn release(&self, track: &TrackInfo);
}

/// One live capture track.
pub struct MediaTrack {
    info: TrackInfo,
    live: AtomicBool,
    device: Arc<dyn DeviceRelease>,
}

impl MediaTrack {
    pub fn new(info: TrackInfo, device: Arc<dyn DeviceRelease>) -> Self {
        Self {
            info,
            live: AtomicBool::new(true),
            device,
        }
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track. The device is released only on the first call.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!("Stopping {:?} track {}", self.info.kind, self.info.id);
            self.device.release(&self.info);
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("info", &self.info)
            .field("live", &self.is_live())
            .finish()
    }
}

/// All local tracks held by one call attempt.
///
/// Dropping the handle stops every track, so no exit path can leak a device.
#[derive(Debug)]
pub struct LocalMediaHandle {
    kind: MediaKind,
    tracks: Vec<MediaTrack>,
}

impl LocalMediaHandle {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn track_infos(&self) -> Vec<TrackInfo> {
        self.tracks.iter().map(|t| t.info().clone()).collect()
    }

    pub fn is_released(&self) -> bool {
        self.tracks.iter().all(|t| !t.is_live())
    }

    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for LocalMediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires and releases local capture devices.
#[derive(Clone)]
pub struct MediaEndpoint {
    devices: Arc<dyn CaptureDevices>,
}

impl MediaEndpoint {
    pub fn new(devices: Arc<dyn CaptureDevices>) -> Self {
        Self { devices }
    }

    /// Open the microphone, and the camera as well for video calls.
    ///
    /// If the camera fails after the microphone was opened, the microphone is
    /// stopped before the error is returned.
    pub async fn acquire(&self, kind: MediaKind) -> Result<LocalMediaHandle, CallError> {
        let microphone = self.devices.open(TrackKind::Audio).await?;
        let mut tracks = scopeguard::guard(vec![microphone], |tracks| {
            for track in &tracks {
                track.stop();
            }
        });

        if kind.wants_camera() {
            let camera = self.devices.open(TrackKind::Video).await?;
            tracks.push(camera);
        }

        let tracks = ScopeGuard::into_inner(tracks);
        info!("Acquired {} local track(s) for {:?} call", tracks.len(), kind);
        Ok(LocalMediaHandle { kind, tracks })
    }

    /// Stop every track of `handle`. Calling it again is a no-op.
    pub fn release(&self, handle: &LocalMediaHandle) {
        if !handle.is_released() {
            debug!("Releasing local media ({} tracks)", handle.tracks.len());
        }
        handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::SimulatedDevices;

    fn endpoint(devices: &SimulatedDevices) -> MediaEndpoint {
        MediaEndpoint::new(Arc::new(devices.clone()))
    }

    #[tokio::test]
    async fn test_voice_acquires_microphone_only() {
        let devices = SimulatedDevices::new();
        let handle = endpoint(&devices).acquire(MediaKind::Voice).await.unwrap();

        assert_eq!(handle.tracks().len(), 1);
        assert_eq!(handle.tracks()[0].info().kind, TrackKind::Audio);
        assert_eq!(devices.live_tracks(), 1);
    }

    #[tokio::test]
    async fn test_video_acquires_microphone_and_camera() {
        let devices = SimulatedDevices::new();
        let handle = endpoint(&devices).acquire(MediaKind::Video).await.unwrap();

        let kinds: Vec<_> = handle.track_infos().into_iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TrackKind::Audio, TrackKind::Video]);
        assert_eq!(devices.live_tracks(), 2);
    }

    #[tokio::test]
    async fn test_release_twice_stops_devices_once() {
        let devices = SimulatedDevices::new();
        let endpoint = endpoint(&devices);
        let handle = endpoint.acquire(MediaKind::Video).await.unwrap();

        endpoint.release(&handle);
        endpoint.release(&handle);
        drop(handle);

        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.device_stops(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_holds_nothing() {
        let devices = SimulatedDevices::new();
        devices.deny_permission(true);

        let err = endpoint(&devices)
            .acquire(MediaKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MediaPermissionDenied(_)));
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_missing_camera_releases_microphone() {
        let devices = SimulatedDevices::new();
        devices.set_camera_present(false);

        let err = endpoint(&devices)
            .acquire(MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert_eq!(devices.opened(), 1);
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.device_stops(), 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_tracks() {
        let devices = SimulatedDevices::new();
        {
            let _handle = endpoint(&devices).acquire(MediaKind::Video).await.unwrap();
            assert_eq!(devices.live_tracks(), 2);
        }
        assert_eq!(devices.live_tracks(), 0);
    }
}
