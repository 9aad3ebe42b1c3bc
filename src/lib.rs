pub mod alarm;
pub mod camera;
pub mod config;
pub mod controller;
pub mod duration;
pub mod error;
pub mod events;
pub mod session;
pub mod timer;

pub use alarm::{Alarm, AlarmState};
pub use camera::{CameraArbiter, CameraFlag, CameraPort};
pub use config::{AlarmConfig, HomeguardConfig};
pub use controller::Controller;
pub use duration::{human_time, parse_duration};
pub use error::{HomeguardError, Result};
pub use events::{AlarmEvent, EventBus, EventKind, SubscriptionId};
pub use session::{AuthFailureReason, AuthSession};
pub use timer::Oneshot;
