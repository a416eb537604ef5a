//! Screen-cast session negotiation with the XDG desktop portal.
//!
//! The portal brokers capture permission on compositor sessions over the
//! session bus. One capture session is four calls against
//! `org.freedesktop.portal.ScreenCast`:
//!
//! 1. `CreateSession`
//! 2. `SelectSources` (monitor vs window, cursor embedded)
//! 3. `Start` — this is where the compositor shows the interactive picker
//! 4. `OpenPipeWireRemote` — yields the media-graph file descriptor
//!
//! Each of the first three is a portal Request: the reply arrives as a
//! `Response` signal on a request object whose path is derived from our
//! unique bus name. We subscribe on that exact path *before* issuing the
//! call, otherwise a fast portal can answer before the match rule exists
//! and the wait deadlocks until timeout.
//!
//! The resulting [`PortalSession`] owns the duplicated PipeWire descriptor,
//! the node id, the session object path, *and the bus connection itself*:
//! dropping the connection invalidates the portal session, so the session
//! must hold it for as long as the stream lives.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{self, ObjectPath, OwnedValue, Value};

use crate::constants;
use crate::error::{CaptureError, CaptureResult};

const PORTAL_DEST: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST_IFACE: &str = "org.freedesktop.portal.ScreenCast";
const SCREENSHOT_IFACE: &str = "org.freedesktop.portal.Screenshot";
const REQUEST_IFACE: &str = "org.freedesktop.portal.Request";
const SESSION_IFACE: &str = "org.freedesktop.portal.Session";

/// Source-type bits for `SelectSources`.
pub(crate) const SOURCE_MONITOR: u32 = 1;
pub(crate) const SOURCE_WINDOW: u32 = 2;

/// Cursor drawn into the frames by the compositor.
const CURSOR_MODE_EMBEDDED: u32 = 2;

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_token() -> String {
    format!("framegrab_{}", TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// An established screen-cast session.
///
/// Field order is load-bearing: fields drop in declaration order, so the
/// duplicated descriptor must be declared before the bus connection that
/// keeps the portal grant alive.
pub(crate) struct PortalSession {
    session_handle: String,
    node_id: u32,
    pipewire_fd: OwnedFd,
    connection: Connection,
}

impl PortalSession {
    /// Negotiates a full session. `source_types` is the `SelectSources`
    /// mask; `Start` blocks on the user picker.
    pub(crate) fn open(source_types: u32) -> CaptureResult<Self> {
        let connection = Connection::session().map_err(|e| {
            CaptureError::Environment(format!(
                "session bus not running: {e}; a D-Bus user session is required for portal capture"
            ))
        })?;

        let sender = sanitized_sender(&connection)?;
        let response_timeout = constants::portal_response_timeout();

        // CreateSession
        let handle_token = next_token();
        let session_token = next_token();
        let pending = PendingRequest::subscribe(&connection, &sender, &handle_token)?;
        let options: HashMap<&str, Value<'_>> = HashMap::from([
            ("handle_token", Value::from(handle_token.as_str())),
            ("session_handle_token", Value::from(session_token.as_str())),
        ]);
        connection
            .call_method(
                Some(PORTAL_DEST),
                PORTAL_PATH,
                Some(SCREENCAST_IFACE),
                "CreateSession",
                &(options,),
            )
            .map_err(|e| CaptureError::Protocol(format!("CreateSession call failed: {e}")))?;
        let results = pending.wait("create session", response_timeout)?;
        let session_handle = string_result(&results, "session_handle").ok_or_else(|| {
            CaptureError::Protocol("CreateSession response carried no session handle".to_string())
        })?;
        tracing::debug!(session = %session_handle, "portal session created");

        let session_path = ObjectPath::try_from(session_handle.as_str())
            .map_err(|e| CaptureError::Protocol(format!("bad session handle: {e}")))?;

        // SelectSources
        let handle_token = next_token();
        let pending = PendingRequest::subscribe(&connection, &sender, &handle_token)?;
        let options: HashMap<&str, Value<'_>> = HashMap::from([
            ("handle_token", Value::from(handle_token.as_str())),
            ("types", Value::from(source_types)),
            ("cursor_mode", Value::from(CURSOR_MODE_EMBEDDED)),
        ]);
        connection
            .call_method(
                Some(PORTAL_DEST),
                PORTAL_PATH,
                Some(SCREENCAST_IFACE),
                "SelectSources",
                &(&session_path, options),
            )
            .map_err(|e| CaptureError::Protocol(format!("SelectSources call failed: {e}")))?;
        pending.wait("select sources", response_timeout)?;

        // Start — the compositor shows the interactive picker here, so the
        // deadline is the generous picker timeout, and a non-zero status
        // means the user cancelled.
        let handle_token = next_token();
        let pending = PendingRequest::subscribe(&connection, &sender, &handle_token)?;
        let options: HashMap<&str, Value<'_>> =
            HashMap::from([("handle_token", Value::from(handle_token.as_str()))]);
        connection
            .call_method(
                Some(PORTAL_DEST),
                PORTAL_PATH,
                Some(SCREENCAST_IFACE),
                "Start",
                &(&session_path, "", options),
            )
            .map_err(|e| CaptureError::Protocol(format!("Start call failed: {e}")))?;
        let results = pending.wait("start screen cast", constants::portal_picker_timeout())?;
        let node_id = first_stream_node(&results)?;
        tracing::debug!(node_id, "portal granted a media-graph stream");

        // OpenPipeWireRemote — a plain method call, no Request round-trip.
        let reply = connection
            .call_method(
                Some(PORTAL_DEST),
                PORTAL_PATH,
                Some(SCREENCAST_IFACE),
                "OpenPipeWireRemote",
                &(&session_path, HashMap::<&str, Value<'_>>::new()),
            )
            .map_err(|e| CaptureError::Protocol(format!("OpenPipeWireRemote failed: {e}")))?;
        let transport_fd: zvariant::OwnedFd = reply
            .body()
            .deserialize()
            .map_err(|e| CaptureError::Protocol(format!("OpenPipeWireRemote reply: {e}")))?;
        // Duplicate into our ownership; the transport's copy goes away with
        // the reply message.
        let pipewire_fd = transport_fd.as_fd().try_clone_to_owned().map_err(|e| {
            CaptureError::Resource(format!("duplicating the PipeWire descriptor failed: {e}"))
        })?;

        Ok(Self {
            session_handle,
            node_id,
            pipewire_fd,
            connection,
        })
    }

    pub(crate) fn node_id(&self) -> u32 {
        self.node_id
    }

    /// A fresh duplicate of the media-graph descriptor for a stream
    /// connection. The session keeps the original.
    pub(crate) fn duplicate_fd(&self) -> CaptureResult<OwnedFd> {
        self.pipewire_fd.try_clone().map_err(|e| {
            CaptureError::Resource(format!("duplicating the PipeWire descriptor failed: {e}"))
        })
    }
}

impl Drop for PortalSession {
    fn drop(&mut self) {
        // Best-effort session close while the connection is still live;
        // the automatic field drops then run in declaration order, so the
        // descriptor is released before the bus connection.
        let _ = self.connection.call_method(
            Some(PORTAL_DEST),
            self.session_handle.as_str(),
            Some(SESSION_IFACE),
            "Close",
            &(),
        );
    }
}

/// The caller's unique bus name in request-path form: leading colon
/// stripped, every other separator replaced with an underscore.
fn sanitized_sender(connection: &Connection) -> CaptureResult<String> {
    let unique = connection.unique_name().ok_or_else(|| {
        CaptureError::Protocol("session bus connection has no unique name".to_string())
    })?;
    Ok(unique.trim_start_matches(':').replace(['.', ':'], "_"))
}

fn request_path(sender: &str, token: &str) -> String {
    format!("/org/freedesktop/portal/desktop/request/{sender}/{token}")
}

/// A subscription to one request object's `Response` signal.
///
/// The signal iterator runs on a helper thread feeding a channel so the
/// wait can carry a deadline; zbus's blocking iterator has none of its own.
/// On timeout the helper thread ends when the connection (and with it the
/// message stream) goes away.
struct PendingRequest {
    rx: mpsc::Receiver<(u32, HashMap<String, OwnedValue>)>,
}

impl PendingRequest {
    fn subscribe(connection: &Connection, sender: &str, token: &str) -> CaptureResult<Self> {
        let path = request_path(sender, token);
        let proxy = Proxy::new(
            connection,
            PORTAL_DEST.to_string(),
            path,
            REQUEST_IFACE.to_string(),
        )
        .map_err(|e| CaptureError::Protocol(format!("request subscription failed: {e}")))?;
        let signals = proxy
            .receive_signal("Response")
            .map_err(|e| CaptureError::Protocol(format!("request subscription failed: {e}")))?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("framegrab-portal-signal".to_string())
            .spawn(move || {
                for message in signals {
                    if let Ok(body) =
                        message.body().deserialize::<(u32, HashMap<String, OwnedValue>)>()
                    {
                        let _ = tx.send(body);
                        return;
                    }
                }
            })
            .map_err(|e| CaptureError::Resource(format!("signal thread spawn failed: {e}")))?;

        Ok(Self { rx })
    }

    fn wait(
        self,
        operation: &str,
        timeout: Duration,
    ) -> CaptureResult<HashMap<String, OwnedValue>> {
        let (status, results) = self.rx.recv_timeout(timeout).map_err(|_| {
            CaptureError::Timeout(format!(
                "portal response for {operation} did not arrive within {}s",
                timeout.as_secs()
            ))
        })?;
        if status != 0 {
            return Err(CaptureError::Permission(format!(
                "{operation} denied (status={status})"
            )));
        }
        Ok(results)
    }
}

fn string_result(results: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    match results.get(key).map(|v| &**v) {
        Some(Value::Str(s)) => Some(s.to_string()),
        Some(Value::ObjectPath(p)) => Some(p.to_string()),
        _ => None,
    }
}

/// Pulls the first node identifier out of a Start response's `streams`
/// array of `(node_id, properties)` structs.
fn first_stream_node(results: &HashMap<String, OwnedValue>) -> CaptureResult<u32> {
    let Some(Value::Array(streams)) = results.get("streams").map(|v| &**v) else {
        return Err(CaptureError::Protocol(
            "no media-graph stream in the portal response".to_string(),
        ));
    };
    for entry in streams.iter() {
        if let Value::Structure(fields) = entry {
            if let Some(Value::U32(node_id)) = fields.fields().first() {
                return Ok(*node_id);
            }
        }
    }
    Err(CaptureError::Protocol(
        "no media-graph stream in the portal response".to_string(),
    ))
}

/// One-shot screenshot over the portal's Screenshot interface.
///
/// Returns the validated filesystem path of the temporary file the portal
/// wrote. The caller decodes and deletes it.
pub(crate) fn take_portal_screenshot() -> CaptureResult<std::path::PathBuf> {
    let connection = Connection::session().map_err(|e| {
        CaptureError::Environment(format!("session bus not running: {e}"))
    })?;
    let sender = sanitized_sender(&connection)?;

    let handle_token = next_token();
    let pending = PendingRequest::subscribe(&connection, &sender, &handle_token)?;
    let options: HashMap<&str, Value<'_>> =
        HashMap::from([("handle_token", Value::from(handle_token.as_str()))]);
    connection
        .call_method(
            Some(PORTAL_DEST),
            PORTAL_PATH,
            Some(SCREENSHOT_IFACE),
            "Screenshot",
            &("", options),
        )
        .map_err(|e| CaptureError::Protocol(format!("Screenshot call failed: {e}")))?;
    let results = pending.wait("screenshot", constants::portal_picker_timeout())?;

    let uri = string_result(&results, "uri").ok_or_else(|| {
        CaptureError::Protocol("screenshot response carried no uri".to_string())
    })?;
    parse_screenshot_uri(&uri)
}

/// Validates a portal screenshot URI: `file://` scheme, absolute path, no
/// current- or parent-directory segments.
pub(crate) fn parse_screenshot_uri(uri: &str) -> CaptureResult<std::path::PathBuf> {
    let path = uri.strip_prefix("file://").ok_or_else(|| {
        CaptureError::Protocol(format!("screenshot uri is not a file:// uri: {uri}"))
    })?;
    if !path.starts_with('/') {
        return Err(CaptureError::Protocol(format!(
            "screenshot uri carries a relative path: {uri}"
        )));
    }
    if path.contains("/./") || path.contains("/../") || path.ends_with("/.") || path.ends_with("/..")
    {
        return Err(CaptureError::Protocol(format!(
            "screenshot uri path contains dot segments: {uri}"
        )));
    }
    Ok(std::path::PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_path_substitutes_separators() {
        // A unique name like ":1.42" becomes "1_42" in the request path.
        let sender = ":1.42".trim_start_matches(':').replace(['.', ':'], "_");
        assert_eq!(sender, "1_42");
        assert_eq!(
            request_path(&sender, "framegrab_0"),
            "/org/freedesktop/portal/desktop/request/1_42/framegrab_0"
        );
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(next_token(), next_token());
    }

    #[test]
    fn screenshot_uri_accepts_plain_absolute_paths() {
        let path = parse_screenshot_uri("file:///tmp/shot.png").unwrap();
        assert_eq!(path, std::path::PathBuf::from("/tmp/shot.png"));
    }

    #[test]
    fn screenshot_uri_rejects_bad_inputs() {
        assert!(parse_screenshot_uri("http://example.com/shot.png").is_err());
        assert!(parse_screenshot_uri("file://relative/shot.png").is_err());
        assert!(parse_screenshot_uri("file:///tmp/../etc/passwd").is_err());
        assert!(parse_screenshot_uri("file:///tmp/./shot.png").is_err());
        assert!(parse_screenshot_uri("file:///tmp/..").is_err());
    }
}
