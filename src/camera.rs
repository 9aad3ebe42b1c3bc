//! Camera resource arbitration.
//!
//! The underlying hardware exposes exactly two capture channels and degrades
//! under more than two simultaneous consumers. This arbiter is the single
//! authority preventing over-subscription: it tracks which capture modes are
//! active, caps them at two, and tracks the single holder of the still port.

use crate::error::{HomeguardError, Result};
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

/// Concurrent capture modes competing for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFlag {
    TakingPicture,
    Streaming,
    MotionDetecting,
    Timelapsing,
}

impl CameraFlag {
    pub const ALL: [CameraFlag; 4] = [
        CameraFlag::TakingPicture,
        CameraFlag::Streaming,
        CameraFlag::MotionDetecting,
        CameraFlag::Timelapsing,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CameraFlag::TakingPicture => "taking_picture",
            CameraFlag::Streaming => "streaming",
            CameraFlag::MotionDetecting => "motion_detecting",
            CameraFlag::Timelapsing => "timelapsing",
        }
    }
}

impl fmt::Display for CameraFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two physical capture channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraPort {
    Still,
    Video,
}

// Hardware cap on simultaneous capture modes
const MAX_CONCURRENT_MODES: usize = 2;

#[derive(Debug, Default)]
struct ArbiterState {
    active: Vec<CameraFlag>,
    still_holder: Option<CameraFlag>,
}

impl ArbiterState {
    fn describe(&self) -> String {
        if self.active.is_empty() {
            return "not busy".to_string();
        }
        CameraFlag::ALL
            .iter()
            .filter(|flag| self.active.contains(flag))
            .map(|flag| flag.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Serializes capture-mode acquisition for the shared camera.
///
/// All acquire/release decisions read and mutate under one lock; only the
/// pure status queries tolerate a stale view.
pub struct CameraArbiter {
    state: Mutex<ArbiterState>,
}

impl CameraArbiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ArbiterState::default()),
        }
    }

    /// Acquire a capture mode, optionally requesting a specific port.
    ///
    /// Fails with `AlreadyInState` if the flag is set and with `Busy` if two
    /// modes are already active. With no port preference the still port is
    /// assigned while free, the video port otherwise. An explicit still
    /// request fails with `Busy` while the port is held; an explicit video
    /// request is always granted. Nothing is mutated on failure.
    pub fn acquire_flag(&self, flag: CameraFlag, port: Option<CameraPort>) -> Result<CameraPort> {
        let mut state = self.state.lock();

        if state.active.contains(&flag) {
            return Err(HomeguardError::AlreadyInState {
                flag: flag.name().to_string(),
            });
        }

        if state.active.len() >= MAX_CONCURRENT_MODES {
            return Err(HomeguardError::busy(format!(
                "cannot set flag {}, camera is already {}",
                flag,
                state.describe()
            )));
        }

        let assigned = match port {
            None => {
                if state.still_holder.is_none() {
                    state.still_holder = Some(flag);
                    CameraPort::Still
                } else {
                    CameraPort::Video
                }
            }
            Some(CameraPort::Still) => {
                if state.still_holder.is_some() {
                    return Err(HomeguardError::busy("still port is in use"));
                }
                state.still_holder = Some(flag);
                CameraPort::Still
            }
            Some(CameraPort::Video) => CameraPort::Video,
        };

        state.active.push(flag);
        debug!("Acquired flag {} on {:?} port", flag, assigned);
        Ok(assigned)
    }

    /// Clear a capture mode, freeing the still port if this flag held it.
    /// Releasing a flag that is not set is a no-op.
    pub fn release_flag(&self, flag: CameraFlag) {
        let mut state = self.state.lock();

        if state.still_holder == Some(flag) {
            state.still_holder = None;
        }

        match state.active.iter().position(|active| *active == flag) {
            Some(pos) => {
                state.active.remove(pos);
                debug!("Released flag {}, camera is {}", flag, state.describe());
            }
            None => {
                debug!("Release of unset flag {} ignored", flag);
            }
        }
    }

    /// Status query; the answer may be stale by the time the caller acts.
    pub fn is_flag_set(&self, flag: CameraFlag) -> bool {
        self.state.lock().active.contains(&flag)
    }

    /// Active flag names as a human string, or "not busy" when idle.
    pub fn state_description(&self) -> String {
        self.state.lock().describe()
    }
}

impl Default for CameraArbiter {
    fn default() -> Self {
        Self::new()
    }
}
