//! GDI capture: per-window polling and the monitor fallback path.
//!
//! Windows are captured by blitting the window's device context into a
//! compatible bitmap — preferring `PrintWindow` with the full-content flag,
//! which reaches composited/DirectX windows, and falling back to a direct
//! `BitBlt` — then reading the bitmap back as a top-down 32-bit DIB.
//! Dimensions are keyed on the compositor's extended frame bounds so the
//! invisible resize borders never appear in output. Monitors use a screen
//! device context over the virtual desktop; this is both the screenshot
//! path and the streaming fallback when desktop duplication is
//! unavailable.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use windows::Win32::Foundation::{HWND, RECT};
use windows::Win32::Graphics::Dwm::{DWMWA_EXTENDED_FRAME_BOUNDS, DwmGetWindowAttribute};
use windows::Win32::Graphics::Gdi::{
    BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CreateCompatibleBitmap, CreateCompatibleDC,
    CreateDCW, DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDIBits, GetWindowDC, HDC, ReleaseDC,
    SRCCOPY, SelectObject,
};
use windows::Win32::UI::WindowsAndMessaging::{
    GetWindowRect, IsWindow, PRINT_WINDOW_FLAGS, PrintWindow,
};
use windows::core::{PCWSTR, w};

use super::{Shared, find_output};
use crate::constants;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{Frame, FrameCallback, FrameClock, ImageData, Region};
use crate::pixel;

/// `PW_RENDERFULLCONTENT`: ask DWM to render the window's full composed
/// content, including DirectX surfaces a plain blit would miss.
const RENDER_FULL_CONTENT: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(2);

fn hwnd_from_handle(handle: u64) -> HWND {
    HWND(handle as usize as *mut core::ffi::c_void)
}

pub(super) fn validate_window(handle: u64) -> CaptureResult<()> {
    // SAFETY: IsWindow tolerates arbitrary handle values.
    if unsafe { IsWindow(Some(hwnd_from_handle(handle))) }.as_bool() {
        Ok(())
    } else {
        Err(CaptureError::TargetNotFound(format!(
            "window handle 0x{handle:x} is not a window"
        )))
    }
}

/// Blits `w × h` pixels starting at `(src_x, src_y)` of `src_dc` (or the
/// full composed window when `print_window` is given) and reads them back
/// as canonical RGBA.
unsafe fn blit_to_image(
    src_dc: HDC,
    src_x: i32,
    src_y: i32,
    w: i32,
    h: i32,
    print_window: Option<HWND>,
) -> CaptureResult<ImageData> {
    let len = pixel::checked_rgba_len(w.max(0) as usize, h.max(0) as usize)?;
    if len == 0 {
        return Ok(ImageData::default());
    }

    // SAFETY: every GDI object created here is released before return on
    // all paths; GetDIBits writes exactly len bytes into the buffer sized
    // by the checked primitive.
    unsafe {
        let mem_dc = CreateCompatibleDC(Some(src_dc));
        if mem_dc.is_invalid() {
            return Err(CaptureError::Resource(
                "compatible device context creation failed".to_string(),
            ));
        }
        let bitmap = CreateCompatibleBitmap(src_dc, w, h);
        if bitmap.is_invalid() {
            let _ = DeleteDC(mem_dc);
            return Err(CaptureError::Resource(
                "compatible bitmap creation failed".to_string(),
            ));
        }
        let previous = SelectObject(mem_dc, bitmap.into());

        let mut blitted = false;
        if let Some(hwnd) = print_window {
            blitted = PrintWindow(hwnd, mem_dc, RENDER_FULL_CONTENT).as_bool();
        }
        if !blitted {
            blitted = BitBlt(mem_dc, 0, 0, w, h, Some(src_dc), src_x, src_y, SRCCOPY).is_ok();
        }

        let image = if blitted {
            let mut bmi = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: w,
                    biHeight: -h, // negative height: top-down rows
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let mut image = ImageData::alloc(w as u32, h as u32)?;
            let lines = GetDIBits(
                mem_dc,
                bitmap,
                0,
                h as u32,
                Some(image.pixels.as_mut_ptr().cast()),
                &mut bmi,
                DIB_RGB_COLORS,
            );
            if lines == h {
                // The DIB is BGRA with undefined alpha; swap in place and
                // make the output opaque.
                pixel::swap_channels_inplace(&mut image.pixels, (w * h) as usize);
                for px in image.pixels.chunks_exact_mut(4) {
                    px[3] = 0xFF;
                }
                Ok(image)
            } else {
                Err(CaptureError::Resource(
                    "bitmap readback returned a short result".to_string(),
                ))
            }
        } else {
            Err(CaptureError::Resource(
                "neither PrintWindow nor BitBlt could copy the source".to_string(),
            ))
        };

        SelectObject(mem_dc, previous);
        let _ = DeleteObject(bitmap.into());
        let _ = DeleteDC(mem_dc);
        image
    }
}

/// The window's extended frame bounds in window-local coordinates, clamped
/// to the window rect. Falls back to the full window when DWM has nothing.
fn frame_bounds_crop(hwnd: HWND, window: RECT) -> (u32, u32, u32, u32) {
    let win_w = (window.right - window.left).max(0) as u32;
    let win_h = (window.bottom - window.top).max(0) as u32;
    let mut frame = RECT::default();
    // SAFETY: out-param query with the correct struct size.
    let have_frame = unsafe {
        DwmGetWindowAttribute(
            hwnd,
            DWMWA_EXTENDED_FRAME_BOUNDS,
            (&mut frame as *mut RECT).cast(),
            std::mem::size_of::<RECT>() as u32,
        )
    }
    .is_ok();
    if !have_frame {
        return (0, 0, win_w, win_h);
    }
    Region::new(
        (frame.left - window.left) as f32,
        (frame.top - window.top) as f32,
        (frame.right - frame.left) as f32,
        (frame.bottom - frame.top) as f32,
    )
    .clamp_to(win_w, win_h)
    .unwrap_or((0, 0, win_w, win_h))
}

pub(super) fn capture_window(handle: u64, region: Region) -> CaptureResult<ImageData> {
    let hwnd = hwnd_from_handle(handle);
    validate_window(handle)?;

    let mut rect = RECT::default();
    // SAFETY: out-param query on a validated window.
    unsafe { GetWindowRect(hwnd, &mut rect) }
        .map_err(|e| CaptureError::TargetNotFound(format!("window rect query failed: {e}")))?;
    let w = rect.right - rect.left;
    let h = rect.bottom - rect.top;
    if w <= 0 || h <= 0 {
        return Ok(ImageData::default());
    }

    // SAFETY: the window DC is released after the blit on all paths.
    let full = unsafe {
        let window_dc = GetWindowDC(Some(hwnd));
        if window_dc.is_invalid() {
            return Err(CaptureError::Resource(
                "window device context acquisition failed".to_string(),
            ));
        }
        let image = blit_to_image(window_dc, 0, 0, w, h, Some(hwnd));
        ReleaseDC(Some(hwnd), window_dc);
        image?
    };

    // First cut away everything outside the extended frame bounds, then
    // apply the caller's region within what remains.
    let (fx, fy, fw, fh) = frame_bounds_crop(hwnd, rect);
    let framed = full.cropped(fx, fy, fw, fh)?;
    match region.clamp_to(framed.width, framed.height) {
        Some((x, y, rw, rh)) => framed.cropped(x, y, rw, rh),
        None => Ok(framed),
    }
}

pub(super) fn capture_monitor(monitor_id: u32, region: Region) -> CaptureResult<ImageData> {
    let (_, output) = find_output(monitor_id)?;
    // SAFETY: descriptor query on an enumerated output; the screen DC is
    // deleted after the blit.
    unsafe {
        let desc = output
            .GetDesc()
            .map_err(|e| CaptureError::Resource(format!("output descriptor query failed: {e}")))?;
        let rect = desc.DesktopCoordinates;
        let mon_w = (rect.right - rect.left).max(0) as u32;
        let mon_h = (rect.bottom - rect.top).max(0) as u32;

        let (x, y, w, h) = region
            .clamp_to(mon_w, mon_h)
            .unwrap_or((0, 0, mon_w, mon_h));

        let screen_dc = CreateDCW(w!("DISPLAY"), PCWSTR::null(), PCWSTR::null(), None);
        if screen_dc.is_invalid() {
            return Err(CaptureError::Resource(
                "screen device context creation failed".to_string(),
            ));
        }
        let image = blit_to_image(
            screen_dc,
            rect.left + x as i32,
            rect.top + y as i32,
            w as i32,
            h as i32,
            None,
        );
        let _ = DeleteDC(screen_dc);
        image
    }
}

pub(super) fn window_stream_loop(handle: u64, shared: Arc<Shared>, callback: FrameCallback) {
    let interval = constants::frame_interval();
    let mut clock = FrameClock::new();

    while !shared.stop.load(Ordering::Acquire) {
        let started = std::time::Instant::now();

        if shared.paused.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            continue;
        }

        let region = *shared.region.lock();
        match capture_window(handle, region) {
            Ok(image) if !image.is_empty() => {
                let frame = Frame {
                    image,
                    duration_ms: clock.tick(),
                };
                callback(&frame);
            }
            Ok(_) => {}
            Err(err) => {
                // Minimized or destroyed windows recover or end naturally;
                // keep polling either way.
                tracing::trace!("window capture failed, skipping frame: {err}");
            }
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
}

pub(super) fn monitor_stream_loop(monitor_id: u32, shared: Arc<Shared>, callback: FrameCallback) {
    let interval = constants::frame_interval();
    let mut clock = FrameClock::new();

    while !shared.stop.load(Ordering::Acquire) {
        let started = std::time::Instant::now();

        if shared.paused.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            continue;
        }

        let region = *shared.region.lock();
        match capture_monitor(monitor_id, region) {
            Ok(image) if !image.is_empty() => {
                let frame = Frame {
                    image,
                    duration_ms: clock.tick(),
                };
                callback(&frame);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::trace!("monitor capture failed, skipping frame: {err}");
            }
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
}
