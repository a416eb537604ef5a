//! Error types for capture operations
//!
//! A single error type crosses the API boundary. Variants follow the failure
//! taxonomy of the engine (environment, permission, resource, missing target,
//! runtime protocol, timeout) so callers can distinguish them, and every
//! message names the failing operation plus, where one exists, the remedy:
//! the permission to grant, the package to install, or the environment
//! variable to set.

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Error type for all capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The process environment cannot support capture (no display server,
    /// missing portal, missing media-graph server, shared memory unavailable)
    #[error("capture environment: {0}")]
    Environment(String),

    /// The platform denied access (screen-recording permission, portal
    /// cancellation, display authorization)
    #[error("capture permission: {0}")]
    Permission(String),

    /// A native resource could not be created or an allocation was refused
    #[error("capture resource: {0}")]
    Resource(String),

    /// The requested monitor or window does not exist
    #[error("capture target: {0}")]
    TargetNotFound(String),

    /// A runtime protocol exchange failed (portal RPC, stream negotiation)
    #[error("capture protocol: {0}")]
    Protocol(String),

    /// An operation did not complete within its deadline
    #[error("capture timeout: {0}")]
    Timeout(String),
}

impl CaptureError {
    /// Allocation-guard error used by the checked pixel sizing primitive.
    pub(crate) fn allocation_overflow(width: usize, height: usize) -> Self {
        CaptureError::Resource(format!(
            "pixel buffer allocation of {width}x{height}x4 bytes overflows the address space"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_operation() {
        let err = CaptureError::Environment(
            "no display server: set WAYLAND_DISPLAY or DISPLAY and run from a graphical session"
                .to_string(),
        );
        let msg = err.to_string();
        assert!(msg.contains("WAYLAND_DISPLAY"));
        assert!(msg.contains("DISPLAY"));
    }

    #[test]
    fn allocation_overflow_mentions_pixel_buffer_allocation() {
        let err = CaptureError::allocation_overflow(usize::MAX, usize::MAX);
        assert!(err.to_string().contains("pixel buffer allocation"));
    }

    #[test]
    fn variants_are_distinguishable() {
        let timeout = CaptureError::Timeout("portal response after 60s".into());
        let denied = CaptureError::Permission("create session denied (status=2)".into());
        assert!(matches!(timeout, CaptureError::Timeout(_)));
        assert!(matches!(denied, CaptureError::Permission(_)));
        assert_ne!(timeout.to_string(), denied.to_string());
    }
}
