//! X11 capture backend using x11rb + MIT-SHM.
//!
//! Streams frames from the root window (monitor/region capture) or from a
//! specific window by reading pixel regions into a shared-memory segment
//! the X server writes directly. When the SHM extension is unavailable the
//! loop falls back to per-frame `GetImage` round-trips.
//!
//! # Error regime
//!
//! x11rb surfaces X protocol errors as values on each reply rather than
//! through Xlib's process-fatal handler, so a failed image read (stale
//! window, racing resize) is checked after the explicit round-trip and
//! becomes a skipped frame; a bad window handle becomes a capture error.
//! Nothing here can take the process down.
//!
//! # Locking
//!
//! One mutex covers the region, the derived capture bounds, and the SHM
//! buffer, and is held for the duration of a frame capture. `set_region`
//! takes the same mutex, recomputes the bounds, and reallocates the segment
//! so the next frame observes the new size atomically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use x11rb::connection::Connection;
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as _, Drawable, ImageFormat, ImageOrder, MapState,
};
use x11rb::rust_connection::RustConnection;

use crate::backend::{CaptureBackend, CaptureTarget};
use crate::constants;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{Frame, FrameCallback, FrameClock, ImageData, Monitor, Region, Window};
use crate::pixel;

/// SysV shared-memory segment owned by this process.
///
/// The segment is created with `IPC_PRIVATE` and owner-only permissions,
/// and marked for removal immediately after attach so the kernel reclaims
/// it on last detach even if the process dies without cleanup. An attach
/// result of all-bits-one is the failure sentinel, distinct from null.
struct ShmSegment {
    id: i32,
    addr: *mut libc::c_void,
    size: usize,
}

impl ShmSegment {
    fn new(size: usize) -> CaptureResult<Self> {
        // SAFETY: plain SysV IPC syscalls; ids and addresses are validated
        // before use and the mapping is owned by this struct.
        unsafe {
            let id = libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600);
            if id < 0 {
                return Err(CaptureError::Resource(format!(
                    "shmget of {size} bytes failed; the kernel may limit SysV shared memory (shmmax)"
                )));
            }
            let addr = libc::shmat(id, std::ptr::null(), 0);
            if addr == usize::MAX as *mut libc::c_void {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
                return Err(CaptureError::Resource(
                    "shmat failed to attach the capture segment".to_string(),
                ));
            }
            // Mark for removal now: the id stays valid for the X server's
            // attach, and the kernel frees the segment on last detach.
            libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            Ok(Self { id, addr, size })
        }
    }

    fn as_slice(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.size);
        // SAFETY: the mapping is valid for `size` bytes while self lives and
        // the server only writes within the requested image bounds.
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, len) }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: addr came from a successful shmat on this mapping.
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}

// SAFETY: the mapping is exclusively owned and only dereferenced under the
// capture mutex.
unsafe impl Send for ShmSegment {}

/// A segment plus its server-side attachment.
struct ShmBuffer {
    segment: ShmSegment,
    xid: shm::Seg,
    attached: bool,
}

impl ShmBuffer {
    fn create(conn: &RustConnection, size: usize) -> CaptureResult<Self> {
        let segment = ShmSegment::new(size)?;
        let xid = conn
            .generate_id()
            .map_err(|e| CaptureError::Resource(format!("X id allocation failed: {e}")))?;
        shm::attach(conn, xid, segment.id as u32, false)
            .map_err(|e| CaptureError::Resource(format!("SHM attach request failed: {e}")))?
            .check()
            .map_err(|e| {
                CaptureError::Resource(format!("X server refused the SHM attach: {e}"))
            })?;
        Ok(Self {
            segment,
            xid,
            attached: true,
        })
    }

    /// Detaches the server side; the client mapping is released on drop and
    /// the kernel reclaims the (already removal-marked) segment.
    fn release(&mut self, conn: &RustConnection) {
        if self.attached {
            if let Ok(cookie) = shm::detach(conn, self.xid) {
                let _ = cookie.check();
            }
            self.attached = false;
        }
    }
}

/// What the loop reads from each frame: drawable plus capture origin/size.
#[derive(Debug, Clone, Copy)]
struct CaptureBounds {
    drawable: Drawable,
    x: i16,
    y: i16,
    width: u16,
    height: u16,
    depth: u8,
}

struct CaptureState {
    region: Region,
    bounds: CaptureBounds,
    shm: Option<ShmBuffer>,
}

struct Shared {
    conn: RustConnection,
    shm_available: bool,
    lsb_pixels: bool,
    state: Mutex<CaptureState>,
    paused: AtomicBool,
    stop: AtomicBool,
}

pub(crate) struct X11Backend {
    target: CaptureTarget,
    screen_idx: usize,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl X11Backend {
    pub(crate) fn new(target: CaptureTarget) -> CaptureResult<Self> {
        let (conn, screen_idx) = x11rb::connect(None).map_err(|e| {
            CaptureError::Environment(format!(
                "cannot open the X display: {e}; check DISPLAY and X authorization"
            ))
        })?;

        let shm_available = conn
            .extension_information(shm::X11_EXTENSION_NAME)
            .ok()
            .flatten()
            .is_some();
        if !shm_available {
            tracing::warn!("MIT-SHM extension missing; falling back to GetImage round-trips");
        }
        let lsb_pixels = conn.setup().image_byte_order == ImageOrder::LSB_FIRST;

        let region = target.initial_region();
        let bounds = compute_bounds(&conn, screen_idx, target, region)?;

        Ok(Self {
            target,
            screen_idx,
            shared: Arc::new(Shared {
                conn,
                shm_available,
                lsb_pixels,
                state: Mutex::new(CaptureState {
                    region,
                    bounds,
                    shm: None,
                }),
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
            worker: None,
        })
    }
}

/// Resolves the target and region into a drawable and clamped pixel bounds.
fn compute_bounds(
    conn: &RustConnection,
    screen_idx: usize,
    target: CaptureTarget,
    region: Region,
) -> CaptureResult<CaptureBounds> {
    let screen = &conn.setup().roots[screen_idx];
    let (screen_w, screen_h) = (screen.width_in_pixels, screen.height_in_pixels);

    match target {
        CaptureTarget::Window(handle) => {
            let window = handle as u32;
            let geom = conn
                .get_geometry(window)
                .map_err(|e| CaptureError::Protocol(format!("geometry request failed: {e}")))?
                .reply()
                .map_err(|_| {
                    CaptureError::TargetNotFound(format!("window 0x{handle:x} does not exist"))
                })?;
            // The window itself is the drawable; the region is window-local.
            let (x, y, w, h) = region
                .clamp_to(u32::from(geom.width), u32::from(geom.height))
                .unwrap_or((0, 0, u32::from(geom.width), u32::from(geom.height)));
            Ok(CaptureBounds {
                drawable: window,
                x: x as i16,
                y: y as i16,
                width: w as u16,
                height: h as u16,
                depth: geom.depth,
            })
        }
        CaptureTarget::Monitor(id) => {
            let rect = monitor_rect(conn, screen.root, id)?;
            let effective = if region.is_set() { region } else { rect };
            let (x, y, w, h) = effective
                .clamp_to(u32::from(screen_w), u32::from(screen_h))
                .unwrap_or((0, 0, 0, 0));
            Ok(CaptureBounds {
                drawable: screen.root,
                x: x as i16,
                y: y as i16,
                width: w as u16,
                height: h as u16,
                depth: screen.root_depth,
            })
        }
        CaptureTarget::Primary | CaptureTarget::Region(_) => {
            let (x, y, w, h) = region
                .clamp_to(u32::from(screen_w), u32::from(screen_h))
                .unwrap_or((0, 0, u32::from(screen_w), u32::from(screen_h)));
            Ok(CaptureBounds {
                drawable: screen.root,
                x: x as i16,
                y: y as i16,
                width: w as u16,
                height: h as u16,
                depth: screen.root_depth,
            })
        }
    }
}

/// The rectangle of one RandR monitor, as a region onto the root window.
fn monitor_rect(conn: &RustConnection, root: u32, id: u32) -> CaptureResult<Region> {
    let monitors = conn
        .randr_get_monitors(root, true)
        .map_err(|e| CaptureError::Protocol(format!("monitor query failed: {e}")))?
        .reply()
        .map_err(|e| CaptureError::Protocol(format!("monitor query failed: {e}")))?;
    let info = monitors
        .monitors
        .get(id as usize)
        .ok_or_else(|| CaptureError::TargetNotFound(format!("monitor index {id} out of range")))?;
    Ok(Region::new(
        f32::from(info.x),
        f32::from(info.y),
        f32::from(info.width),
        f32::from(info.height),
    ))
}

/// Reads one frame under the capture lock. `Ok(None)` means the frame was
/// skipped (empty bounds or a recoverable protocol error).
fn grab_frame(shared: &Shared, state: &mut CaptureState) -> CaptureResult<Option<ImageData>> {
    let bounds = state.bounds;
    if bounds.width == 0 || bounds.height == 0 {
        return Ok(None);
    }

    let len = pixel::checked_rgba_len(bounds.width as usize, bounds.height as usize)?;
    let mut image = ImageData::alloc(u32::from(bounds.width), u32::from(bounds.height))?;

    if shared.shm_available {
        if state.shm.as_ref().is_none_or(|b| b.segment.size < len) {
            if let Some(mut old) = state.shm.take() {
                old.release(&shared.conn);
            }
            state.shm = Some(ShmBuffer::create(&shared.conn, len)?);
        }
        let buffer = state.shm.as_ref().expect("shm buffer just ensured");

        let reply = shm::get_image(
            &shared.conn,
            bounds.drawable,
            bounds.x,
            bounds.y,
            bounds.width,
            bounds.height,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            buffer.xid,
            0,
        )
        .map_err(|e| CaptureError::Protocol(format!("SHM image request failed: {e}")))?
        .reply();

        match reply {
            Ok(_) => {
                convert_native_rows(shared, buffer.segment.as_slice(len), &mut image, bounds.depth);
            }
            Err(err) => {
                // Protocol error (window resized away, drawable gone for a
                // beat): skip this frame and keep streaming.
                tracing::trace!("SHM image read failed, skipping frame: {err}");
                return Ok(None);
            }
        }
    } else {
        let reply = shared
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                bounds.drawable,
                bounds.x,
                bounds.y,
                bounds.width,
                bounds.height,
                !0,
            )
            .map_err(|e| CaptureError::Protocol(format!("image request failed: {e}")))?
            .reply();
        match reply {
            Ok(r) if r.data.len() >= len => {
                convert_native_rows(shared, &r.data[..len], &mut image, bounds.depth);
            }
            Ok(_) => return Ok(None),
            Err(err) => {
                tracing::trace!("image read failed, skipping frame: {err}");
                return Ok(None);
            }
        }
    }

    Ok(Some(image))
}

/// Converts a server-native 32-bpp buffer into canonical RGBA.
fn convert_native_rows(shared: &Shared, src: &[u8], image: &mut ImageData, depth: u8) {
    if shared.lsb_pixels {
        // Little-endian ZPixmap pixels arrive as B,G,R,X bytes.
        pixel::convert_bgra_to_rgba(src, &mut image.pixels);
    } else {
        image.pixels.copy_from_slice(src);
    }
    if depth <= 24 {
        for px in image.pixels.chunks_exact_mut(4) {
            px[3] = 0xFF;
        }
    }
}

fn capture_loop(shared: Arc<Shared>, callback: FrameCallback) {
    let interval = constants::frame_interval();
    let mut clock = FrameClock::new();

    while !shared.stop.load(Ordering::Acquire) {
        let started = std::time::Instant::now();

        if shared.paused.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            continue;
        }

        let grabbed = {
            let mut state = shared.state.lock();
            grab_frame(&shared, &mut state)
        };

        match grabbed {
            Ok(Some(image)) => {
                let frame = Frame {
                    image,
                    duration_ms: clock.tick(),
                };
                callback(&frame);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("frame capture failed, continuing: {err}");
            }
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    // Release the segment while the loop still owns a live connection.
    let mut state = shared.state.lock();
    if let Some(mut buffer) = state.shm.take() {
        buffer.release(&shared.conn);
    }
}

impl CaptureBackend for X11Backend {
    fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData> {
        let configured = self.shared.state.lock().region;
        let effective = if region.is_set() { region } else { configured };
        let bounds = compute_bounds(&self.shared.conn, self.screen_idx, self.target, effective)?;
        if bounds.width == 0 || bounds.height == 0 {
            return Ok(ImageData::default());
        }

        let len = pixel::checked_rgba_len(bounds.width as usize, bounds.height as usize)?;
        let reply = self
            .shared
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                bounds.drawable,
                bounds.x,
                bounds.y,
                bounds.width,
                bounds.height,
                !0,
            )
            .map_err(|e| CaptureError::Protocol(format!("image request failed: {e}")))?
            .reply()
            .map_err(|e| {
                CaptureError::TargetNotFound(format!("capture source unavailable: {e}"))
            })?;
        if reply.data.len() < len {
            return Err(CaptureError::Protocol(format!(
                "short image reply: got {} bytes, wanted {len}",
                reply.data.len()
            )));
        }

        let mut image = ImageData::alloc(u32::from(bounds.width), u32::from(bounds.height))?;
        convert_native_rows(&self.shared, &reply.data[..len], &mut image, bounds.depth);
        Ok(image)
    }

    fn start(&mut self, callback: FrameCallback) -> CaptureResult<()> {
        if self.worker.is_some() {
            return Err(CaptureError::Resource(
                "capture stream already running".to_string(),
            ));
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        self.worker = Some(
            std::thread::Builder::new()
                .name("framegrab-x11".to_string())
                .spawn(move || capture_loop(shared, callback))
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
        let bounds = compute_bounds(&self.shared.conn, self.screen_idx, self.target, region)?;
        let mut state = self.shared.state.lock();
        state.region = region;
        state.bounds = bounds;
        // Drop the old segment under the lock; the next frame reallocates to
        // the new size before reading.
        if let Some(mut buffer) = state.shm.take() {
            buffer.release(&self.shared.conn);
        }
        Ok(())
    }
}

impl Drop for X11Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Monitors via RandR, falling back to one virtual screen covering the
/// default screen's dimensions.
pub(crate) fn list_monitors() -> CaptureResult<Vec<Monitor>> {
    let (conn, screen_idx) = x11rb::connect(None).map_err(|e| {
        CaptureError::Environment(format!("cannot open the X display: {e}; check DISPLAY"))
    })?;
    let screen = &conn.setup().roots[screen_idx];

    let monitors = conn
        .randr_get_monitors(screen.root, true)
        .ok()
        .and_then(|cookie| cookie.reply().ok())
        .map(|reply| reply.monitors)
        .unwrap_or_default();

    if monitors.is_empty() {
        return Ok(vec![Monitor {
            id: 0,
            name: "screen-0".to_string(),
            x: 0,
            y: 0,
            width: u32::from(screen.width_in_pixels),
            height: u32::from(screen.height_in_pixels),
            scale: 1.0,
        }]);
    }

    Ok(monitors
        .iter()
        .enumerate()
        .map(|(idx, info)| {
            let name = conn
                .get_atom_name(info.name)
                .ok()
                .and_then(|cookie| cookie.reply().ok())
                .map(|reply| String::from_utf8_lossy(&reply.name).into_owned())
                .unwrap_or_else(|| format!("monitor-{idx}"));
            Monitor {
                id: idx as u32,
                name,
                x: i32::from(info.x),
                y: i32::from(info.y),
                width: u32::from(info.width),
                height: u32::from(info.height),
                scale: 1.0,
            }
        })
        .collect())
}

/// Windows via the `_NET_CLIENT_LIST` root property, preferring the UTF-8
/// `_NET_WM_NAME` title with classic `WM_NAME` as fallback. Unmapped and
/// untitled windows are filtered out.
pub(crate) fn list_windows() -> CaptureResult<Vec<Window>> {
    let (conn, screen_idx) = x11rb::connect(None).map_err(|e| {
        CaptureError::Environment(format!("cannot open the X display: {e}; check DISPLAY"))
    })?;
    let screen = &conn.setup().roots[screen_idx];
    let root = screen.root;

    let intern = |name: &[u8]| -> CaptureResult<u32> {
        Ok(conn
            .intern_atom(false, name)
            .map_err(|e| CaptureError::Protocol(format!("atom intern failed: {e}")))?
            .reply()
            .map_err(|e| CaptureError::Protocol(format!("atom intern failed: {e}")))?
            .atom)
    };
    let net_client_list = intern(b"_NET_CLIENT_LIST")?;
    let net_wm_name = intern(b"_NET_WM_NAME")?;
    let utf8_string = intern(b"UTF8_STRING")?;

    let list = conn
        .get_property(false, root, net_client_list, AtomEnum::WINDOW, 0, 4096)
        .map_err(|e| CaptureError::Protocol(format!("client list query failed: {e}")))?
        .reply()
        .map_err(|e| CaptureError::Protocol(format!("client list query failed: {e}")))?;

    let mut windows = Vec::new();
    for id in list.value32().into_iter().flatten() {
        let Some(attrs) = conn
            .get_window_attributes(id)
            .ok()
            .and_then(|c| c.reply().ok())
        else {
            continue;
        };
        if attrs.map_state != MapState::VIEWABLE {
            continue;
        }

        let utf8_title = conn
            .get_property(false, id, net_wm_name, utf8_string, 0, 8192)
            .ok()
            .and_then(|c| c.reply().ok())
            .map(|r| String::from_utf8_lossy(&r.value).into_owned())
            .unwrap_or_default();
        let title = if utf8_title.is_empty() {
            conn.get_property(false, id, AtomEnum::WM_NAME, AtomEnum::STRING, 0, 8192)
                .ok()
                .and_then(|c| c.reply().ok())
                .map(|r| r.value.iter().map(|&b| b as char).collect())
                .unwrap_or_default()
        } else {
            utf8_title
        };
        if title.is_empty() {
            continue;
        }

        let Some(geom) = conn.get_geometry(id).ok().and_then(|c| c.reply().ok()) else {
            continue;
        };
        let (x, y) = conn
            .translate_coordinates(id, root, 0, 0)
            .ok()
            .and_then(|c| c.reply().ok())
            .map(|r| (i32::from(r.dst_x), i32::from(r.dst_y)))
            .unwrap_or((i32::from(geom.x), i32::from(geom.y)));

        windows.push(Window {
            handle: u64::from(id),
            name: title,
            x,
            y,
            width: u32::from(geom.width),
            height: u32::from(geom.height),
        });
    }

    Ok(windows)
}
