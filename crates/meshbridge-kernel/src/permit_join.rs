//! [`PermitJoinWindow`] – the single network-wide join window.
//!
//! The window is a flag plus an absolute deadline.  Expiry is evaluated
//! lazily: whoever asks after the deadline sees the window closed, even when
//! the deferred close scheduled by the controller has not fired yet.

use std::time::{Duration, Instant};

use meshbridge_types::BridgeError;

/// Window length used when the caller does not choose one.
pub const DEFAULT_PERMIT_JOIN_SECS: u16 = 60;

/// Longest window the radio protocol can express.
pub const MAX_PERMIT_JOIN_SECS: u16 = 254;

/// Reject durations the radio cannot honour (`0` means "close", not "open").
pub fn validate_duration(secs: u16) -> Result<Duration, BridgeError> {
    if secs == 0 || secs > MAX_PERMIT_JOIN_SECS {
        return Err(BridgeError::Configuration(format!(
            "permit-join duration must be 1-{MAX_PERMIT_JOIN_SECS} seconds, got {secs}"
        )));
    }
    Ok(Duration::from_secs(u64::from(secs)))
}

/// Join window state.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use meshbridge_kernel::PermitJoinWindow;
///
/// let now = Instant::now();
/// let mut window = PermitJoinWindow::default();
/// window.open(now, Duration::from_secs(60));
///
/// assert!(window.is_open_at(now + Duration::from_secs(30)));
/// assert!(!window.is_open_at(now + Duration::from_secs(61)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermitJoinWindow {
    active: bool,
    ends_at: Option<Instant>,
}

impl PermitJoinWindow {
    /// Mark the window open until `now + duration`.  Reopening extends or
    /// shortens the current window.
    pub fn open(&mut self, now: Instant, duration: Duration) {
        self.active = true;
        self.ends_at = Some(now + duration);
    }

    /// Close the window.  Returns whether it was active.
    pub fn close(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        self.ends_at = None;
        was_active
    }

    /// Whether the window admits devices at `now`; past the deadline it
    /// reads closed even before [`close`](Self::close) is called.
    pub fn is_open_at(&self, now: Instant) -> bool {
        self.active && self.ends_at.is_some_and(|end| now <= end)
    }

    /// Time left before the deadline, `None` when closed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if !self.active {
            return None;
        }
        self.ends_at.map(|end| end.saturating_duration_since(now))
    }

}
