//! macOS capture backend.
//!
//! Streaming rides ScreenCaptureKit: an `SCStream` built from a content
//! filter delivers BGRA sample buffers on a private serial dispatch queue,
//! where the output delegate locks each pixel buffer read-only, crops,
//! converts to canonical RGBA, and invokes the consumer callback. Start and
//! stop both block on completion handlers so the state machine stays
//! synchronous. One-shot screenshots go through the CoreGraphics display
//! and window-list image APIs instead; they need no stream and work
//! per-call.
//!
//! All per-stream state lives in the delegate's instance variables — the
//! sample handler runs on a framework thread and must not reach for
//! globals.

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use block2::RcBlock;
use core_foundation::base::{CFType, TCFType, ToVoid};
use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
use core_foundation::number::{CFNumber, CFNumberRef};
use core_foundation::string::CFString;
use core_graphics::display::{CGDisplay, CGPoint, CGRect, CGSize};
use core_graphics::window as cg_window;
use objc2::rc::Retained;
use objc2::runtime::NSObject as RuntimeNSObject;
use objc2::{AnyThread, define_class, msg_send};
use objc2_core_media::{CMSampleBuffer, CMTime};
use objc2_foundation::{NSArray, NSError, NSObject, NSObjectProtocol};
use objc2_screen_capture_kit::{
    SCContentFilter, SCDisplay, SCShareableContent, SCStream, SCStreamConfiguration,
    SCStreamOutput, SCStreamOutputType, SCWindow,
};
use parking_lot::Mutex;

use crate::backend::{CaptureBackend, CaptureTarget};
use crate::error::{CaptureError, CaptureResult};
use crate::model::{Frame, FrameCallback, ImageData, Monitor, PermissionReport, Region, Window};
use crate::pixel;

/// kCVPixelFormatType_32BGRA
const PIXEL_FORMAT_BGRA: u32 = 1_111_970_369;
const QUEUE_DEPTH: isize = 5;
const STREAM_FPS: i32 = 60;

#[link(name = "CoreMedia", kind = "framework")]
unsafe extern "C" {
    fn CMSampleBufferGetImageBuffer(sbuf: *mut c_void) -> *mut c_void;
    fn CMSampleBufferGetPresentationTimeStamp(sbuf: *mut c_void) -> CMTime;
}

#[link(name = "CoreVideo", kind = "framework")]
unsafe extern "C" {
    fn CVPixelBufferGetBaseAddress(pbuf: *mut c_void) -> *mut c_void;
    fn CVPixelBufferGetBytesPerRow(pbuf: *mut c_void) -> usize;
    fn CVPixelBufferGetWidth(pbuf: *mut c_void) -> usize;
    fn CVPixelBufferGetHeight(pbuf: *mut c_void) -> usize;
    fn CVPixelBufferLockBaseAddress(pbuf: *mut c_void, flags: u64) -> i32;
    fn CVPixelBufferUnlockBaseAddress(pbuf: *mut c_void, flags: u64) -> i32;
}

#[link(name = "CoreGraphics", kind = "framework")]
unsafe extern "C" {
    fn CGPreflightScreenCaptureAccess() -> bool;
}

#[link(name = "System", kind = "dylib")]
unsafe extern "C" {
    fn dispatch_queue_create(label: *const i8, attr: *mut c_void) -> *mut c_void;
}

const CV_LOCK_READ_ONLY: u64 = 1;

/// State shared between the backend and the sample handler.
struct Shared {
    paused: AtomicBool,
    state: Mutex<StreamState>,
}

struct StreamState {
    region: Region,
    /// Presentation timestamp of the previously delivered frame, seconds.
    last_pts: Option<f64>,
}

pub(crate) struct OutputIvars {
    shared: Arc<Shared>,
    callback: FrameCallback,
}

define_class!(
    #[unsafe(super(NSObject))]
    #[name = "FramegrabStreamOutput"]
    #[ivars = OutputIvars]
    pub(crate) struct StreamOutput;

    impl StreamOutput {
        #[unsafe(method(stream:didOutputSampleBuffer:ofType:))]
        fn did_output(&self, _stream: &SCStream, sample: &CMSampleBuffer, kind: SCStreamOutputType) {
            if kind != SCStreamOutputType::Screen {
                return;
            }
            let ivars = self.ivars();
            // Paused: discard before touching the pixel buffer, so there is
            // no lock to pair.
            if ivars.shared.paused.load(Ordering::Acquire) {
                return;
            }

            // SAFETY: the sample buffer is valid for the duration of this
            // delegate call; lock/unlock are paired around every access to
            // the base address.
            unsafe {
                let sbuf = sample as *const CMSampleBuffer as *mut c_void;
                let pixel_buffer = CMSampleBufferGetImageBuffer(sbuf);
                if pixel_buffer.is_null() {
                    return;
                }
                let pts = CMSampleBufferGetPresentationTimeStamp(sbuf);

                if CVPixelBufferLockBaseAddress(pixel_buffer, CV_LOCK_READ_ONLY) != 0 {
                    return;
                }
                let width = CVPixelBufferGetWidth(pixel_buffer);
                let height = CVPixelBufferGetHeight(pixel_buffer);
                let stride = CVPixelBufferGetBytesPerRow(pixel_buffer);
                let base = CVPixelBufferGetBaseAddress(pixel_buffer);

                let image = if base.is_null() || width == 0 || height == 0 {
                    None
                } else {
                    let region = ivars.shared.state.lock().region;
                    copy_pixel_buffer(base.cast::<u8>(), stride, width, height, region)
                };
                CVPixelBufferUnlockBaseAddress(pixel_buffer, CV_LOCK_READ_ONLY);

                let Some(image) = image else { return };
                let duration_ms = ivars.shared.duration_from_pts(pts);
                (ivars.callback)(&Frame { image, duration_ms });
            }
        }
    }
);

unsafe impl SCStreamOutput for StreamOutput {}
unsafe impl NSObjectProtocol for StreamOutput {}

impl StreamOutput {
    fn new(shared: Arc<Shared>, callback: FrameCallback) -> Retained<Self> {
        let this = Self::alloc().set_ivars(OutputIvars { shared, callback });
        // SAFETY: standard two-step init of a declared class.
        unsafe { msg_send![super(this), init] }
    }
}

impl Shared {
    /// Inter-frame duration from sample presentation timestamps. The first
    /// delivery (and any non-monotonic timestamp) yields 0.0 — durations
    /// are never negative and never inherit a huge initial value.
    fn duration_from_pts(&self, pts: CMTime) -> f64 {
        let seconds = if pts.timescale > 0 {
            pts.value as f64 / pts.timescale as f64
        } else {
            return 0.0;
        };
        let mut state = self.state.lock();
        let duration = match state.last_pts {
            Some(prev) if seconds >= prev => (seconds - prev) * 1000.0,
            _ => 0.0,
        };
        state.last_pts = Some(seconds);
        duration
    }
}

/// Copies a locked BGRA pixel buffer into canonical RGBA, cropping to the
/// clamped region.
unsafe fn copy_pixel_buffer(
    base: *const u8,
    stride: usize,
    width: usize,
    height: usize,
    region: Region,
) -> Option<ImageData> {
    let (x, y, w, h) = region
        .clamp_to(width as u32, height as u32)
        .unwrap_or((0, 0, width as u32, height as u32));
    let mut image = ImageData::alloc(w, h).ok()?;
    let row_bytes = w as usize * 4;
    for row in 0..h as usize {
        // SAFETY: caller holds the base-address lock and the clamped bounds
        // lie inside the buffer's stride × height extent.
        let src = unsafe {
            std::slice::from_raw_parts(
                base.add((y as usize + row) * stride + x as usize * 4),
                row_bytes,
            )
        };
        pixel::convert_bgra_to_rgba(src, &mut image.pixels[row * row_bytes..(row + 1) * row_bytes]);
    }
    Some(image)
}

/// The live stream and its delegate, retained together.
struct ActiveStream {
    stream: Retained<SCStream>,
    _output: Retained<StreamOutput>,
}

pub(crate) struct MacOsBackend {
    target: CaptureTarget,
    shared: Arc<Shared>,
    active: Option<ActiveStream>,
}

// SAFETY: SCStream and the delegate are only messaged from this handle;
// ScreenCaptureKit objects tolerate use from any thread, and the sample
// handler runs on its own dispatch queue regardless of where the handle
// lives.
unsafe impl Send for MacOsBackend {}

impl MacOsBackend {
    pub(crate) fn new(target: CaptureTarget) -> CaptureResult<Self> {
        Ok(Self {
            target,
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                state: Mutex::new(StreamState {
                    region: target.initial_region(),
                    last_pts: None,
                }),
            }),
            active: None,
        })
    }
}

/// Fetches the shareable content synchronously, blocking on the framework's
/// completion handler.
fn shareable_content() -> CaptureResult<Retained<SCShareableContent>> {
    let (tx, rx) = std::sync::mpsc::channel::<Result<SendRetained<SCShareableContent>, String>>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let handler = RcBlock::new(
        move |content: *mut SCShareableContent, error: *mut NSError| {
            let Some(tx) = tx.lock().take() else { return };
            if !error.is_null() {
                // SAFETY: non-null NSError from the framework.
                let message = unsafe { (*error).localizedDescription() }.to_string();
                let _ = tx.send(Err(message));
            } else {
                // SAFETY: content is valid when error is null.
                match unsafe { Retained::retain(content) } {
                    Some(content) => {
                        let _ = tx.send(Ok(SendRetained(content)));
                    }
                    None => {
                        let _ = tx.send(Err("no shareable content returned".to_string()));
                    }
                }
            }
        },
    );
    // SAFETY: the block outlives the call; ScreenCaptureKit retains it.
    unsafe {
        SCShareableContent::getShareableContentWithCompletionHandler(&handler);
    }

    match rx.recv_timeout(Duration::from_secs(10)) {
        Ok(Ok(content)) => Ok(content.0),
        Ok(Err(message)) => Err(CaptureError::Permission(format!(
            "shareable content query failed: {message}; grant Screen Recording permission in \
             System Settings > Privacy & Security > Screen Recording"
        ))),
        Err(_) => Err(CaptureError::Timeout(
            "shareable content query did not complete within 10s".to_string(),
        )),
    }
}

/// Retained pointer moved across the completion-handler thread boundary.
struct SendRetained<T>(Retained<T>);
// SAFETY: only used to hand a retained framework object from the completion
// queue back to the waiting caller.
unsafe impl<T> Send for SendRetained<T> {}

fn display_by_target(
    content: &SCShareableContent,
    target: CaptureTarget,
) -> CaptureResult<Retained<SCDisplay>> {
    // SAFETY: framework getters on a retained content snapshot.
    let displays = unsafe { content.displays() };
    let index = match target {
        CaptureTarget::Monitor(id) => id as usize,
        _ => 0,
    };
    if index >= displays.len() {
        return Err(CaptureError::TargetNotFound(format!(
            "monitor index {index} out of range ({} displays present)",
            displays.len()
        )));
    }
    Ok(displays.objectAtIndex(index))
}

fn window_by_handle(
    content: &SCShareableContent,
    handle: u64,
) -> CaptureResult<Retained<SCWindow>> {
    // SAFETY: framework getters on a retained content snapshot.
    let windows = unsafe { content.windows() };
    for window in windows.iter() {
        if u64::from(unsafe { window.windowID() }) == handle {
            return Ok(window);
        }
    }
    Err(CaptureError::TargetNotFound(format!(
        "window handle 0x{handle:x} is not on screen"
    )))
}

impl CaptureBackend for MacOsBackend {
    fn screenshot(&mut self, region: Region) -> CaptureResult<ImageData> {
        let configured = self.shared.state.lock().region;
        let effective = if region.is_set() { region } else { configured };

        let cg_image = match self.target {
            CaptureTarget::Window(handle) => {
                let null_rect = CGRect::new(
                    &CGPoint::new(f64::INFINITY, f64::INFINITY),
                    &CGSize::new(0.0, 0.0),
                );
                cg_window::create_image(
                    null_rect,
                    cg_window::kCGWindowListOptionIncludingWindow,
                    handle as u32,
                    cg_window::kCGWindowImageBoundsIgnoreFraming,
                )
                .ok_or_else(|| {
                    CaptureError::TargetNotFound(format!(
                        "window list image for 0x{handle:x} failed; the window may be gone or \
                         Screen Recording permission is missing"
                    ))
                })?
            }
            CaptureTarget::Monitor(id) => {
                let ids = CGDisplay::active_displays().map_err(|e| {
                    CaptureError::Resource(format!("display enumeration failed (CGError {e})"))
                })?;
                let display_id = *ids.get(id as usize).ok_or_else(|| {
                    CaptureError::TargetNotFound(format!("monitor index {id} out of range"))
                })?;
                CGDisplay::new(display_id).image().ok_or_else(|| {
                    CaptureError::Permission(
                        "display image capture failed; grant Screen Recording permission in \
                         System Settings > Privacy & Security > Screen Recording"
                            .to_string(),
                    )
                })?
            }
            CaptureTarget::Primary | CaptureTarget::Region(_) => {
                CGDisplay::main().image().ok_or_else(|| {
                    CaptureError::Permission(
                        "display image capture failed; grant Screen Recording permission in \
                         System Settings > Privacy & Security > Screen Recording"
                            .to_string(),
                    )
                })?
            }
        };

        let image = cg_image_to_rgba(&cg_image)?;
        match effective.clamp_to(image.width, image.height) {
            Some((x, y, w, h)) => image.cropped(x, y, w, h),
            None => Ok(image),
        }
    }

    fn start(&mut self, callback: FrameCallback) -> CaptureResult<()> {
        if self.active.is_some() {
            return Err(CaptureError::Resource(
                "capture stream already running".to_string(),
            ));
        }
        self.shared.state.lock().last_pts = None;

        let content = shareable_content()?;

        // SAFETY: filter/configuration construction and property setters are
        // plain framework calls on freshly allocated objects.
        let (filter, width, height) = unsafe {
            match self.target {
                CaptureTarget::Window(handle) => {
                    let window = window_by_handle(&content, handle)?;
                    let frame = window.frame();
                    let filter = SCContentFilter::initWithDesktopIndependentWindow(
                        SCContentFilter::alloc(),
                        &window,
                    );
                    (filter, frame.size.width as usize, frame.size.height as usize)
                }
                _ => {
                    let display = display_by_target(&content, self.target)?;
                    let filter = SCContentFilter::initWithDisplay_excludingApplications_exceptingWindows(
                        SCContentFilter::alloc(),
                        &display,
                        &NSArray::new(),
                        &NSArray::new(),
                    );
                    (filter, display.width() as usize, display.height() as usize)
                }
            }
        };

        // SAFETY: configuration setters on an owned object.
        let config = unsafe {
            let config = SCStreamConfiguration::new();
            config.setWidth(width);
            config.setHeight(height);
            config.setQueueDepth(QUEUE_DEPTH);
            config.setPixelFormat(PIXEL_FORMAT_BGRA);
            config.setMinimumFrameInterval(CMTime {
                value: 1,
                timescale: STREAM_FPS,
                flags: objc2_core_media::CMTimeFlags(1),
                epoch: 0,
            });
            config
        };

        // SAFETY: stream init with retained filter/config; delegate None.
        let stream = unsafe {
            SCStream::initWithFilter_configuration_delegate(
                SCStream::alloc(),
                &filter,
                &config,
                None,
            )
        };

        let output = StreamOutput::new(Arc::clone(&self.shared), callback);

        // SAFETY: the sample handler queue is a fresh serial queue owned by
        // the stream once attached; msg_send mirrors the typed signature.
        unsafe {
            let queue = dispatch_queue_create(c"dev.framegrab.sck".as_ptr(), std::ptr::null_mut());
            let _: bool = msg_send![
                &stream,
                addStreamOutput: &*output,
                type: SCStreamOutputType::Screen,
                sampleHandlerQueue: queue as *mut RuntimeNSObject,
                error: std::ptr::null_mut::<*mut NSError>()
            ];
        }

        // Block until the framework reports the stream started (or failed).
        let (tx, rx) = std::sync::mpsc::channel::<Option<String>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let start_handler = RcBlock::new(move |error: *mut NSError| {
            let Some(tx) = tx.lock().take() else { return };
            if error.is_null() {
                let _ = tx.send(None);
            } else {
                // SAFETY: non-null NSError from the framework.
                let message = unsafe { (*error).localizedDescription() }.to_string();
                let _ = tx.send(Some(message));
            }
        });
        // SAFETY: the completion block is retained by the framework.
        unsafe {
            stream.startCaptureWithCompletionHandler(Some(&*start_handler));
        }
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(None) => {}
            Ok(Some(message)) => {
                return Err(CaptureError::Permission(format!(
                    "stream start failed: {message}; grant Screen Recording permission in \
                     System Settings > Privacy & Security > Screen Recording"
                )));
            }
            Err(_) => {
                return Err(CaptureError::Timeout(
                    "stream start did not complete within 10s".to_string(),
                ));
            }
        }

        self.active = Some(ActiveStream {
            stream,
            _output: output,
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let (tx, rx) = std::sync::mpsc::channel::<()>();
            let tx = Arc::new(Mutex::new(Some(tx)));
            let handler = RcBlock::new(move |_error: *mut NSError| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            });
            // SAFETY: stop on a retained stream; the block is retained by
            // the framework.
            unsafe {
                active.stream.stopCaptureWithCompletionHandler(Some(&*handler));
            }
            let _ = rx.recv_timeout(Duration::from_secs(5));
            // The output delegate is released with `active`.
        }
        self.shared.state.lock().last_pts = None;
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
        self.shared.state.lock().region = region;
        Ok(())
    }
}

impl Drop for MacOsBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Renders a CGImage into a tightly packed RGBA buffer.
fn cg_image_to_rgba(image: &core_graphics::image::CGImage) -> CaptureResult<ImageData> {
    let width = image.width() as u32;
    let height = image.height() as u32;
    let stride = image.bytes_per_row();
    let data = image.data();
    let bytes = data.bytes();

    let len = pixel::checked_rgba_len(width as usize, height as usize)?;
    if len == 0 {
        return Ok(ImageData::default());
    }
    let row_bytes = width as usize * 4;
    if stride < row_bytes || bytes.len() < stride * (height as usize - 1) + row_bytes {
        return Err(CaptureError::Resource(
            "display image has an unexpected layout".to_string(),
        ));
    }

    let mut out = ImageData::alloc(width, height)?;
    for row in 0..height as usize {
        let src = &bytes[row * stride..row * stride + row_bytes];
        pixel::convert_bgra_to_rgba(src, &mut out.pixels[row * row_bytes..(row + 1) * row_bytes]);
    }
    // CoreGraphics hands out BGRX/premultiplied surfaces; emit opaque alpha.
    for px in out.pixels.chunks_exact_mut(4) {
        px[3] = 0xFF;
    }
    Ok(out)
}

pub(crate) fn list_monitors() -> CaptureResult<Vec<Monitor>> {
    let ids = CGDisplay::active_displays().map_err(|e| {
        CaptureError::Resource(format!("display enumeration failed (CGError {e})"))
    })?;
    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(idx, id)| {
            let display = CGDisplay::new(id);
            let bounds = display.bounds();
            let pixels_wide = display.pixels_wide() as u32;
            let pixels_high = display.pixels_high() as u32;
            let scale = if bounds.size.width > 0.0 {
                (pixels_wide as f64 / bounds.size.width).max(1.0) as f32
            } else {
                1.0
            };
            Monitor {
                id: idx as u32,
                name: if display.is_builtin() {
                    "Built-in Display".to_string()
                } else {
                    format!("Display {id}")
                },
                x: bounds.origin.x as i32,
                y: bounds.origin.y as i32,
                width: pixels_wide,
                height: pixels_high,
                scale,
            }
        })
        .collect())
}

pub(crate) fn list_windows() -> CaptureResult<Vec<Window>> {
    let info = cg_window::copy_window_info(
        cg_window::kCGWindowListOptionOnScreenOnly
            | cg_window::kCGWindowListExcludeDesktopElements,
        cg_window::kCGNullWindowID,
    )
    .ok_or_else(|| {
        CaptureError::Resource("on-screen window list query failed".to_string())
    })?;

    let key_name = CFString::from_static_string("kCGWindowName");
    let key_layer = CFString::from_static_string("kCGWindowLayer");
    let key_number = CFString::from_static_string("kCGWindowNumber");
    let key_bounds = CFString::from_static_string("kCGWindowBounds");

    let mut windows = Vec::new();
    for &item in info.get_all_values().iter() {
        if item.is_null() {
            continue;
        }
        // SAFETY: copy_window_info yields an array of CFDictionary entries.
        let dict: CFDictionary<CFString, CFType> =
            unsafe { CFDictionary::wrap_under_get_rule(item as CFDictionaryRef) };

        // Layer 0 only: skips the menu bar, dock, and system overlays.
        let layer = dict
            .find(&key_layer)
            .and_then(|v| v.downcast::<CFNumber>())
            .and_then(|n| n.to_i64())
            .unwrap_or(i64::MAX);
        if layer != 0 {
            continue;
        }

        let name = match dict
            .find(&key_name)
            .and_then(|v| v.downcast::<CFString>())
            .map(|s| s.to_string())
        {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };

        let Some(number) = dict
            .find(&key_number)
            .and_then(|v| v.downcast::<CFNumber>())
            .and_then(|n| n.to_i64())
        else {
            continue;
        };

        let Some((x, y, w, h)) = dict
            .find(&key_bounds)
            .and_then(|v| v.downcast::<CFDictionary>())
            .and_then(|d| bounds_rect(&d))
        else {
            continue;
        };

        windows.push(Window {
            handle: number as u64,
            name,
            x: x as i32,
            y: y as i32,
            width: w.max(0.0) as u32,
            height: h.max(0.0) as u32,
        });
    }
    Ok(windows)
}

/// Decodes a `kCGWindowBounds` sub-dictionary: four CFNumber entries keyed
/// `X`, `Y`, `Width`, `Height` (CGRectCreateDictionaryRepresentation form).
fn bounds_rect(dict: &CFDictionary) -> Option<(f64, f64, f64, f64)> {
    let field = |name: &'static str| -> Option<f64> {
        let key = CFString::from_static_string(name);
        dict.find(key.to_void()).and_then(|value| {
            // SAFETY: bounds entries are CFNumbers per the window-list
            // contract; wrap_under_get_rule retains before use.
            unsafe { CFNumber::wrap_under_get_rule(*value as CFNumberRef) }.to_f64()
        })
    };
    Some((field("X")?, field("Y")?, field("Width")?, field("Height")?))
}

pub(crate) fn diagnose_permissions() -> PermissionReport {
    // SAFETY: preflight query with no side effects (it never prompts).
    let granted = unsafe { CGPreflightScreenCaptureAccess() };
    if granted {
        PermissionReport::ok("Screen Recording permission granted")
    } else {
        PermissionReport::error(
            "Screen Recording permission not granted",
            vec![
                "open System Settings > Privacy & Security > Screen Recording".to_string(),
                "add this application to the allowed list, then relaunch it".to_string(),
            ],
        )
    }
}
