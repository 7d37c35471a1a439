//! Local capture devices for calls.
//!
//! - [`MediaEndpoint`]: scoped acquisition of microphone and camera
//! - [`LocalMediaHandle`]: the tracks held for one call attempt, released on drop
//! - [`CaptureDevices`]: the platform seam that actually opens devices
//! - [`SimulatedDevices`]: in-process devices for tests and the demo binary

mod endpoint;
mod simulated;

pub use endpoint::{CaptureDevices, DeviceRelease, LocalMediaHandle, MediaEndpoint, MediaTrack};
pub use simulated::SimulatedDevices;
