//! Backend capability contract and runtime dispatch.
//!
//! Each platform realizes the same small capability set; the façade holds a
//! backend behind `Box<dyn CaptureBackend>` and never learns the host OS.

use crate::error::CaptureResult;
use crate::model::{FrameCallback, ImageData, Monitor, PermissionReport, Region, Window};

/// What a capturer instance is pointed at, chosen at construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureTarget {
    /// The primary monitor.
    Primary,
    /// A monitor by its enumeration identifier.
    Monitor(u32),
    /// A window by its opaque handle. On Wayland the handle is ignored and
    /// the portal picker selects the window interactively.
    Window(u64),
    /// A fixed rectangle of the virtual screen.
    Region(Region),
}

impl CaptureTarget {
    /// The region implied by the target itself, if any.
    pub(crate) fn initial_region(&self) -> Region {
        match self {
            CaptureTarget::Region(region) => *region,
            _ => Region::unset(),
        }
    }
}

/// The capability set every platform backend realizes.
///
/// Lifecycle: Idle → (start) → Running ⇄ (pause/resume) Paused → (stop)
/// → Stopped, after which the instance is reusable. `stop` is idempotent
/// and joins all producer threads; dropping a running backend stops it.
pub(crate) trait CaptureBackend: Send {
    /// Synchronous one-shot capture. An unset `region` falls back to the
    /// instance's configured region, then to the full source.
    fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData>;

    /// Begins streaming frames to `callback`. Fails if already running.
    fn start(&mut self, callback: FrameCallback) -> CaptureResult<()>;

    /// Stops streaming, joins the producer, and releases native handles.
    fn stop(&mut self);

    /// Suspends callback delivery; the producer keeps servicing the
    /// platform's buffer-return protocol while discarding frames.
    fn pause(&mut self);

    fn resume(&mut self);

    fn is_paused(&self) -> bool;

    /// Updates the active crop rectangle; safe from any thread. The next
    /// produced frame reflects the new region.
    fn set_region(&mut self, region: Region) -> CaptureResult<()>;
}

/// Builds the backend for the current platform.
///
/// On Linux the choice between the Wayland and X11 paths is made from the
/// process environment; see the module docs of [`crate::backends::linux`].
pub(crate) fn create_backend(target: CaptureTarget) -> CaptureResult<Box<dyn CaptureBackend>> {
    #[cfg(target_os = "linux")]
    {
        crate::backends::linux::create_backend(target)
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(crate::backends::windows::WindowsBackend::new(
            target,
        )?))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(crate::backends::macos::MacOsBackend::new(target)?))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        let _ = target;
        Err(crate::error::CaptureError::Environment(
            "screen capture is not supported on this platform".to_string(),
        ))
    }
}

pub(crate) fn list_monitors() -> CaptureResult<Vec<Monitor>> {
    #[cfg(target_os = "linux")]
    {
        crate::backends::linux::list_monitors()
    }

    #[cfg(target_os = "windows")]
    {
        crate::backends::windows::list_monitors()
    }

    #[cfg(target_os = "macos")]
    {
        crate::backends::macos::list_monitors()
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        Ok(Vec::new())
    }
}

pub(crate) fn list_windows() -> CaptureResult<Vec<Window>> {
    #[cfg(target_os = "linux")]
    {
        crate::backends::linux::list_windows()
    }

    #[cfg(target_os = "windows")]
    {
        crate::backends::windows::list_windows()
    }

    #[cfg(target_os = "macos")]
    {
        crate::backends::macos::list_windows()
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        Ok(Vec::new())
    }
}

pub(crate) fn diagnose_permissions() -> PermissionReport {
    #[cfg(target_os = "linux")]
    {
        crate::backends::linux::diagnose_permissions()
    }

    #[cfg(target_os = "windows")]
    {
        crate::backends::windows::diagnose_permissions()
    }

    #[cfg(target_os = "macos")]
    {
        crate::backends::macos::diagnose_permissions()
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        PermissionReport::error(
            "screen capture is not supported on this platform",
            Vec::new(),
        )
    }
}
