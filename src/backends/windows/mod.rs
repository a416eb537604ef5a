//! Windows capture backend.
//!
//! Monitors stream through DXGI desktop duplication with a reusable staging
//! texture ([`duplication`]); if duplication cannot be initialized (older
//! remote sessions, exotic drivers) the loop falls back to GDI polling.
//! Windows always stream through GDI polling ([`gdi`]) since duplication is
//! a per-output facility. One-shot screenshots take the GDI path on both
//! source kinds: a single blit needs no duplication session and cannot
//! stall waiting for a changed frame.

mod duplication;
mod gdi;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT, TRUE};
use windows::Win32::Graphics::Dwm::{
    DWMWA_CLOAKED, DWMWA_EXTENDED_FRAME_BOUNDS, DwmGetWindowAttribute,
};
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory1, IDXGIOutput};
use windows::Win32::Graphics::Gdi::{
    DEVMODEW, ENUM_CURRENT_SETTINGS, EnumDisplaySettingsW, GetMonitorInfoW, MONITORINFO,
    MONITORINFOEXW,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GWL_EXSTYLE, GetWindowLongW, GetWindowTextLengthW, GetWindowTextW,
    IsWindowVisible, WS_EX_TOOLWINDOW,
};

use crate::backend::{CaptureBackend, CaptureTarget};
use crate::error::{CaptureError, CaptureResult};
use crate::model::{FrameCallback, ImageData, Monitor, PermissionReport, Region, Window};

/// Flags and region shared with the capture thread.
pub(super) struct Shared {
    pub(super) paused: AtomicBool,
    pub(super) stop: AtomicBool,
    pub(super) region: Mutex<Region>,
}

pub(crate) struct WindowsBackend {
    target: CaptureTarget,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WindowsBackend {
    pub(crate) fn new(target: CaptureTarget) -> CaptureResult<Self> {
        // Validate the target eagerly so a bad index fails at construction.
        match target {
            CaptureTarget::Monitor(id) => {
                find_output(id)?;
            }
            CaptureTarget::Window(handle) => {
                gdi::validate_window(handle)?;
            }
            CaptureTarget::Primary | CaptureTarget::Region(_) => {}
        }
        Ok(Self {
            target,
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                region: Mutex::new(target.initial_region()),
            }),
            worker: None,
        })
    }

    fn monitor_index(&self) -> u32 {
        match self.target {
            CaptureTarget::Monitor(id) => id,
            _ => 0,
        }
    }
}

impl CaptureBackend for WindowsBackend {
    fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData> {
        let configured = *self.shared.region.lock();
        let effective = if region.is_set() { region } else { configured };
        match self.target {
            CaptureTarget::Window(handle) => gdi::capture_window(handle, effective),
            _ => gdi::capture_monitor(self.monitor_index(), effective),
        }
    }

    fn start(&mut self, callback: FrameCallback) -> CaptureResult<()> {
        if self.worker.is_some() {
            return Err(CaptureError::Resource(
                "capture stream already running".to_string(),
            ));
        }
        self.shared.stop.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let target = self.target;
        let monitor = self.monitor_index();
        self.worker = Some(
            std::thread::Builder::new()
                .name("framegrab-win".to_string())
                .spawn(move || match target {
                    CaptureTarget::Window(handle) => {
                        gdi::window_stream_loop(handle, shared, callback);
                    }
                    _ => {
                        duplication::monitor_stream_loop(monitor, shared, callback);
                    }
                })
                .map_err(|e| CaptureError::Resource(format!("capture thread spawn failed: {e}")))?,
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    fn resume(&mut self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    fn set_region(&mut self, region: Region) -> CaptureResult<()> {
        *self.shared.region.lock() = region;
        Ok(())
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolves a flat monitor index to its `(adapter, output)` pair, counting
/// outputs across adapters in declaration order.
pub(super) fn find_output(monitor_id: u32) -> CaptureResult<(IDXGIAdapter1, IDXGIOutput)> {
    // SAFETY: plain DXGI factory/adapter enumeration; every interface is
    // reference-counted by the wrapper types.
    unsafe {
        let factory: IDXGIFactory1 = CreateDXGIFactory1()
            .map_err(|e| CaptureError::Resource(format!("DXGI factory creation failed: {e}")))?;
        let mut flat = 0u32;
        let mut adapter_idx = 0u32;
        while let Ok(adapter) = factory.EnumAdapters1(adapter_idx) {
            let mut output_idx = 0u32;
            while let Ok(output) = adapter.EnumOutputs(output_idx) {
                if flat == monitor_id {
                    return Ok((adapter, output));
                }
                flat += 1;
                output_idx += 1;
            }
            adapter_idx += 1;
        }
        Err(CaptureError::TargetNotFound(format!(
            "monitor index {monitor_id} out of range ({flat} outputs present)"
        )))
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

pub(crate) fn list_monitors() -> CaptureResult<Vec<Monitor>> {
    let mut monitors = Vec::new();
    // SAFETY: DXGI enumeration plus out-param monitor queries with
    // correctly sized structs.
    unsafe {
        let factory: IDXGIFactory1 = CreateDXGIFactory1()
            .map_err(|e| CaptureError::Resource(format!("DXGI factory creation failed: {e}")))?;
        let mut flat = 0u32;
        let mut adapter_idx = 0u32;
        while let Ok(adapter) = factory.EnumAdapters1(adapter_idx) {
            let mut output_idx = 0u32;
            while let Ok(output) = adapter.EnumOutputs(output_idx) {
                if let Ok(desc) = output.GetDesc() {
                    let rect = desc.DesktopCoordinates;
                    let logical_width = (rect.right - rect.left).max(0) as u32;

                    let mut info = MONITORINFOEXW {
                        monitorInfo: MONITORINFO {
                            cbSize: std::mem::size_of::<MONITORINFOEXW>() as u32,
                            ..Default::default()
                        },
                        ..Default::default()
                    };
                    let have_info = GetMonitorInfoW(
                        desc.Monitor,
                        (&mut info as *mut MONITORINFOEXW).cast::<MONITORINFO>(),
                    )
                    .as_bool();
                    let name = if have_info {
                        wide_to_string(&info.szDevice)
                    } else {
                        wide_to_string(&desc.DeviceName)
                    };

                    // Scale = physical (current display mode) over logical
                    // (virtual-screen rect) horizontal resolution.
                    let mut devmode = DEVMODEW {
                        dmSize: std::mem::size_of::<DEVMODEW>() as u16,
                        ..Default::default()
                    };
                    let scale = if have_info
                        && EnumDisplaySettingsW(
                            windows::core::PCWSTR(info.szDevice.as_ptr()),
                            ENUM_CURRENT_SETTINGS,
                            &mut devmode,
                        )
                        .as_bool()
                        && logical_width > 0
                        && devmode.dmPelsWidth >= logical_width
                    {
                        devmode.dmPelsWidth as f32 / logical_width as f32
                    } else {
                        1.0
                    };

                    monitors.push(Monitor {
                        id: flat,
                        name,
                        x: rect.left,
                        y: rect.top,
                        width: logical_width,
                        height: (rect.bottom - rect.top).max(0) as u32,
                        scale,
                    });
                }
                flat += 1;
                output_idx += 1;
            }
            adapter_idx += 1;
        }
    }
    Ok(monitors)
}

extern "system" fn enum_windows_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: lparam carries the Vec pointer for the duration of the
    // EnumWindows call; window queries use correctly sized out params.
    unsafe {
        let windows = &mut *(lparam.0 as *mut Vec<Window>);

        if !IsWindowVisible(hwnd).as_bool() {
            return TRUE;
        }
        let style = GetWindowLongW(hwnd, GWL_EXSTYLE) as u32;
        if style & WS_EX_TOOLWINDOW.0 != 0 {
            return TRUE;
        }
        let mut cloaked = 0u32;
        if DwmGetWindowAttribute(
            hwnd,
            DWMWA_CLOAKED,
            (&mut cloaked as *mut u32).cast(),
            std::mem::size_of::<u32>() as u32,
        )
        .is_ok()
            && cloaked != 0
        {
            return TRUE;
        }

        let title_len = GetWindowTextLengthW(hwnd);
        if title_len <= 0 {
            return TRUE;
        }
        let mut buf = vec![0u16; title_len as usize + 1];
        let copied = GetWindowTextW(hwnd, &mut buf);
        if copied <= 0 {
            return TRUE;
        }
        let name = String::from_utf16_lossy(&buf[..copied as usize]);

        // Key dimensions on the compositor's extended frame bounds, which
        // exclude the invisible resize borders.
        let mut bounds = RECT::default();
        if DwmGetWindowAttribute(
            hwnd,
            DWMWA_EXTENDED_FRAME_BOUNDS,
            (&mut bounds as *mut RECT).cast(),
            std::mem::size_of::<RECT>() as u32,
        )
        .is_err()
        {
            return TRUE;
        }

        windows.push(Window {
            handle: hwnd.0 as usize as u64,
            name,
            x: bounds.left,
            y: bounds.top,
            width: (bounds.right - bounds.left).max(0) as u32,
            height: (bounds.bottom - bounds.top).max(0) as u32,
        });
        TRUE
    }
}

pub(crate) fn list_windows() -> CaptureResult<Vec<Window>> {
    let mut windows: Vec<Window> = Vec::new();
    // SAFETY: the callback only dereferences the Vec pointer passed here.
    unsafe {
        EnumWindows(
            Some(enum_windows_proc),
            LPARAM(&mut windows as *mut Vec<Window> as isize),
        )
        .map_err(|e| CaptureError::Protocol(format!("window enumeration failed: {e}")))?;
    }
    Ok(windows)
}

pub(crate) fn diagnose_permissions() -> PermissionReport {
    // Desktop capture needs no permission grant on Windows; readiness is a
    // question of whether a desktop session and DXGI are reachable.
    match unsafe { CreateDXGIFactory1::<IDXGIFactory1>() } {
        Ok(_) => PermissionReport::ok("Windows desktop session ready for capture"),
        Err(err) => PermissionReport::error(
            "DXGI is unavailable",
            vec![
                format!("factory creation failed: {err}"),
                "capture requires an interactive desktop session (not a service session)"
                    .to_string(),
            ],
        ),
    }
}
