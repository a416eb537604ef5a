//! Monitor streaming via DXGI desktop duplication.
//!
//! One duplication session per output hands out each composed desktop frame
//! as a GPU texture; the loop copies it into a reusable CPU-readable
//! staging texture, maps it, crops, converts to canonical RGBA, and
//! delivers. "Access lost" (lock screen, UAC desktop, RDP reconnect) tears
//! the session down and reinitializes in place; only a failed
//! reinitialization surfaces as the end of the stream, at which point the
//! loop degrades to GDI polling.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_FLAG, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device,
    ID3D11DeviceContext, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO, IDXGIAdapter,
    IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
};
use windows::core::Interface;

use super::{Shared, find_output, gdi};
use crate::constants;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{Frame, FrameCallback, FrameClock, ImageData, Region};
use crate::pixel;

/// Everything one duplication session owns. Rebuilt wholesale on access
/// loss; dropped wholesale on stop.
struct DuplicationSession {
    #[allow(dead_code)] // keeps the device alive for the duplication
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging: ID3D11Texture2D,
    width: u32,
    height: u32,
}

impl DuplicationSession {
    fn create(monitor_id: u32) -> CaptureResult<Self> {
        let (adapter1, output) = find_output(monitor_id)?;

        // SAFETY: device creation with out params, followed by COM casts on
        // interfaces we own; all failure paths drop what was created.
        unsafe {
            let adapter: IDXGIAdapter = adapter1.cast().map_err(|e| {
                CaptureError::Resource(format!("adapter interface query failed: {e}"))
            })?;

            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| {
                CaptureError::Resource(format!("Direct3D device creation failed: {e}"))
            })?;
            let device = device.ok_or_else(|| {
                CaptureError::Resource("Direct3D device creation returned nothing".to_string())
            })?;
            let context = context.ok_or_else(|| {
                CaptureError::Resource("Direct3D context creation returned nothing".to_string())
            })?;

            let output1: IDXGIOutput1 = output.cast().map_err(|e| {
                CaptureError::Resource(format!("output duplication is unsupported here: {e}"))
            })?;
            let duplication = output1.DuplicateOutput(&device).map_err(|e| {
                CaptureError::Resource(format!(
                    "output duplication creation failed: {e}; \
                     another session may hold the output, or this is a restricted desktop"
                ))
            })?;

            let desc = output.GetDesc().map_err(|e| {
                CaptureError::Resource(format!("output descriptor query failed: {e}"))
            })?;
            let rect = desc.DesktopCoordinates;
            let width = (rect.right - rect.left).max(0) as u32;
            let height = (rect.bottom - rect.top).max(0) as u32;

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut staging: Option<ID3D11Texture2D> = None;
            device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(|e| {
                    CaptureError::Resource(format!("staging texture creation failed: {e}"))
                })?;
            let staging = staging.ok_or_else(|| {
                CaptureError::Resource("staging texture creation returned nothing".to_string())
            })?;

            Ok(Self {
                device,
                context,
                duplication,
                staging,
                width,
                height,
            })
        }
    }

    /// Acquires, copies, and converts one frame.
    ///
    /// `Ok(None)` skips the iteration (timeout, unchanged desktop, benign
    /// acquire failure); `Err` reports access loss to the caller for
    /// reinitialization.
    fn grab(&mut self, region: Region) -> Result<Option<ImageData>, ()> {
        // SAFETY: the duplication, staging texture, and context belong to
        // this session; Map/Unmap are paired and ReleaseFrame runs on every
        // path after a successful acquire.
        unsafe {
            let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource: Option<IDXGIResource> = None;
            match self.duplication.AcquireNextFrame(
                constants::ACQUIRE_FRAME_TIMEOUT_MS,
                &mut frame_info,
                &mut resource,
            ) {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
                Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                    tracing::debug!("desktop access lost; reinitializing duplication");
                    return Err(());
                }
                Err(e) => {
                    tracing::trace!("acquire failed, skipping frame: {e}");
                    return Ok(None);
                }
            }

            // A zero presentation time means only mouse movement; there are
            // no new pixels to copy.
            if frame_info.LastPresentTime == 0 {
                let _ = self.duplication.ReleaseFrame();
                return Ok(None);
            }

            let copied = resource
                .and_then(|r| r.cast::<ID3D11Texture2D>().ok())
                .map(|texture| self.context.CopyResource(&self.staging, &texture))
                .is_some();
            let _ = self.duplication.ReleaseFrame();
            if !copied {
                return Ok(None);
            }

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            if self
                .context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .is_err()
            {
                return Ok(None);
            }

            let image = copy_mapped(
                mapped.pData.cast::<u8>(),
                mapped.RowPitch as usize,
                self.width,
                self.height,
                region,
            );
            self.context.Unmap(&self.staging, 0);
            Ok(image.ok())
        }
    }
}

/// Crops (per the clamp policy) and converts a mapped BGRA surface.
unsafe fn copy_mapped(
    base: *const u8,
    row_pitch: usize,
    src_width: u32,
    src_height: u32,
    region: Region,
) -> CaptureResult<ImageData> {
    let (x, y, w, h) = region
        .clamp_to(src_width, src_height)
        .unwrap_or((0, 0, src_width, src_height));
    let mut image = ImageData::alloc(w, h)?;
    let row_bytes = w as usize * 4;
    for row in 0..h as usize {
        // SAFETY: caller guarantees the mapping covers src_height rows of
        // row_pitch bytes, and the clamped bounds lie inside it.
        let src_row = unsafe {
            std::slice::from_raw_parts(
                base.add((y as usize + row) * row_pitch + x as usize * 4),
                row_bytes,
            )
        };
        pixel::convert_bgra_to_rgba(
            src_row,
            &mut image.pixels[row * row_bytes..(row + 1) * row_bytes],
        );
    }
    Ok(image)
}

pub(super) fn monitor_stream_loop(monitor_id: u32, shared: Arc<Shared>, callback: FrameCallback) {
    let mut session = match DuplicationSession::create(monitor_id) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!("desktop duplication unavailable ({err}); using GDI polling");
            gdi::monitor_stream_loop(monitor_id, shared, callback);
            return;
        }
    };

    let mut clock = FrameClock::new();
    let pause_interval = constants::frame_interval();

    while !shared.stop.load(Ordering::Acquire) {
        if shared.paused.load(Ordering::Acquire) {
            std::thread::sleep(pause_interval);
            continue;
        }

        let region = *shared.region.lock();
        match session.grab(region) {
            Ok(Some(image)) => {
                let frame = Frame {
                    image,
                    duration_ms: clock.tick(),
                };
                callback(&frame);
            }
            Ok(None) => {}
            Err(()) => {
                // Device access lost: rebuild the whole session. Only a
                // failed rebuild ends duplication, and then GDI takes over.
                drop(session);
                match DuplicationSession::create(monitor_id) {
                    Ok(rebuilt) => session = rebuilt,
                    Err(err) => {
                        tracing::warn!(
                            "duplication reinitialization failed ({err}); using GDI polling"
                        );
                        gdi::monitor_stream_loop(monitor_id, shared, callback);
                        return;
                    }
                }
            }
        }
    }
}
