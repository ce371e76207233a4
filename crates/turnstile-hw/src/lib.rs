//! turnstile-hw: Camera capture for the access point.
//!
//! Provides V4L2-based camera access and conversion of raw capture
//! buffers to grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::Frame;
