//! Centralized timing constants for the capture backends.
//!
//! Values can be overridden at runtime via environment variables, which is
//! mainly useful on slow systems (CI, remote X servers) where the defaults
//! fire false positives:
//!
//! | Environment Variable | Default | Description |
//! |---------------------|---------|-------------|
//! | `FRAMEGRAB_FRAME_INTERVAL_MS` | 16 | Polling-loop frame interval (X11, GDI) |
//! | `FRAMEGRAB_PORTAL_RESPONSE_TIMEOUT_SECS` | 60 | Portal request/response timeout |
//! | `FRAMEGRAB_PORTAL_PICKER_TIMEOUT_SECS` | 120 | Interactive source-picker timeout |
//! | `FRAMEGRAB_SCREENSHOT_TIMEOUT_SECS` | 5 | Wayland one-shot frame safety stop |

use std::time::Duration;

/// Target interval between frames for the polling backends (~60 Hz).
pub const FRAME_INTERVAL_MS: u64 = 16;

/// Default timeout for a portal request's Response signal.
///
/// Plain RPCs (CreateSession, SelectSources) answer quickly; the generous
/// deadline covers a loaded session bus without masking a dead portal.
pub const PORTAL_RESPONSE_TIMEOUT_SECS: u64 = 60;

/// Timeout for the portal Start call, which blocks on the interactive
/// picker dialog. The user may reasonably take a while here.
pub const PORTAL_PICKER_TIMEOUT_SECS: u64 = 120;

/// Safety stop for the Wayland one-shot screenshot stream.
pub const SCREENSHOT_TIMEOUT_SECS: u64 = 5;

/// Windows desktop-duplication per-iteration acquire timeout.
pub const ACQUIRE_FRAME_TIMEOUT_MS: u32 = 100;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Frame interval honoring `FRAMEGRAB_FRAME_INTERVAL_MS`.
pub fn frame_interval() -> Duration {
    Duration::from_millis(env_u64("FRAMEGRAB_FRAME_INTERVAL_MS", FRAME_INTERVAL_MS))
}

/// Portal response deadline honoring `FRAMEGRAB_PORTAL_RESPONSE_TIMEOUT_SECS`.
pub fn portal_response_timeout() -> Duration {
    Duration::from_secs(env_u64(
        "FRAMEGRAB_PORTAL_RESPONSE_TIMEOUT_SECS",
        PORTAL_RESPONSE_TIMEOUT_SECS,
    ))
}

/// Picker deadline honoring `FRAMEGRAB_PORTAL_PICKER_TIMEOUT_SECS`.
pub fn portal_picker_timeout() -> Duration {
    Duration::from_secs(env_u64(
        "FRAMEGRAB_PORTAL_PICKER_TIMEOUT_SECS",
        PORTAL_PICKER_TIMEOUT_SECS,
    ))
}

/// One-shot screenshot deadline honoring `FRAMEGRAB_SCREENSHOT_TIMEOUT_SECS`.
pub fn screenshot_timeout() -> Duration {
    Duration::from_secs(env_u64(
        "FRAMEGRAB_SCREENSHOT_TIMEOUT_SECS",
        SCREENSHOT_TIMEOUT_SECS,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_overrides() {
        temp_env::with_var_unset("FRAMEGRAB_FRAME_INTERVAL_MS", || {
            assert_eq!(frame_interval(), Duration::from_millis(16));
        });
    }

    #[test]
    fn env_override_wins() {
        temp_env::with_var("FRAMEGRAB_FRAME_INTERVAL_MS", Some("33"), || {
            assert_eq!(frame_interval(), Duration::from_millis(33));
        });
    }

    #[test]
    fn garbage_override_falls_back_to_default() {
        temp_env::with_var("FRAMEGRAB_SCREENSHOT_TIMEOUT_SECS", Some("soon"), || {
            assert_eq!(screenshot_timeout(), Duration::from_secs(5));
        });
    }
}
