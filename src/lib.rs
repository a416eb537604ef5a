//! framegrab: cross-platform screen capture engine
//!
//! This library captures pixels from a live desktop session in three ways:
//! one-shot screenshots of a display, window, or arbitrary screen rectangle;
//! a live stream of frames delivered to a consumer callback; and enumeration
//! of displays and windows plus a permission diagnostic for the host
//! environment.
//!
//! Platform backends:
//! - **Windows**: DXGI desktop duplication with a GDI fallback
//! - **macOS**: ScreenCaptureKit stream, CoreGraphics one-shots
//! - **Linux/X11**: MIT-SHM image capture
//! - **Linux/Wayland**: XDG desktop portal + PipeWire stream
//!
//! Frames are always delivered as tightly packed RGBA8888, top-down,
//! stride = width × 4.
//!
//! # Examples
//!
//! ```rust,ignore
//! use framegrab::{CaptureTarget, Capturer, Region};
//!
//! let mut capturer = Capturer::new(CaptureTarget::Primary)?;
//! capturer.on_frame(|frame| {
//!     println!("{}x{} (+{:.1}ms)", frame.image.width, frame.image.height, frame.duration_ms);
//! });
//! capturer.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(3));
//! capturer.stop();
//! ```

pub mod constants;
pub mod error;
pub mod model;
pub mod pixel;
pub mod queue;

mod backend;
mod backends;
mod facade;

pub use backend::CaptureTarget;
pub use error::{CaptureError, CaptureResult};
pub use facade::Capturer;
pub use model::{
    Frame, FrameCallback, ImageData, Monitor, PermissionReport, PermissionStatus, Region, Window,
};
pub use queue::FrameQueue;

/// Lists the monitors attached to the current session.
///
/// Monitor identifiers returned here are the values accepted by
/// [`CaptureTarget::Monitor`].
pub fn list_monitors() -> CaptureResult<Vec<Monitor>> {
    backend::list_monitors()
}

/// Lists the capturable top-level windows of the current session.
///
/// On Wayland this returns an empty list: the compositor security model
/// offers no programmatic window enumeration, and window capture goes
/// through the portal picker instead.
pub fn list_windows() -> CaptureResult<Vec<Window>> {
    backend::list_windows()
}

/// Probes the host environment for capture readiness.
///
/// Never fails; problems are reported through the returned
/// [`PermissionReport`] with actionable detail strings.
pub fn diagnose_permissions() -> PermissionReport {
    backend::diagnose_permissions()
}
