use crate::config::AlarmConfig;
use crate::duration::{human_time, parse_duration};
use crate::error::{HomeguardError, Result};
use crate::events::{AlarmEvent, EventBus, EventKind};
use crate::session::{AuthFailureReason, AuthSession};
use crate::timer::Oneshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Window after a successful authentication during which the authenticator
/// is expected to call `set_disarm_time`; on expiry the alarm is disabled.
const DISARM_CONFIG_GRACE: Duration = Duration::from_secs(60);

/// The canonical alarm states and their legal transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Armed,
    Disabled,
    Disarmed,
    Authenticating,
    Alarming,
}

impl AlarmState {
    /// Legal target states from this state. Self-transitions are always
    /// rejected separately, as "already in state".
    pub fn next_states(&self) -> &'static [AlarmState] {
        use AlarmState::*;
        match self {
            Armed => &[Disabled, Disarmed, Authenticating],
            Disabled => &[Armed, Disarmed],
            Disarmed => &[Armed, Disabled],
            Authenticating => &[Disabled, Disarmed, Alarming],
            Alarming => &[Disabled, Armed],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlarmState::Armed => "ARMED",
            AlarmState::Disabled => "DISABLED",
            AlarmState::Disarmed => "DISARMED",
            AlarmState::Authenticating => "AUTHENTICATING",
            AlarmState::Alarming => "ALARMING",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The only durable state: written after every persisted transition, read
/// once at startup.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedAlarmRecord {
    state: AlarmState,
    disarm_time: u64,
}

/// The alarm state machine.
///
/// Owns the single canonical state, enforces the transition table, persists
/// state to disk, creates and drops authentication sessions and manages the
/// authentication-timeout and post-authentication grace timers. Sensors and
/// authenticators are tracked purely through their `*_started`/`*_stopped`
/// events; the alarm never calls into them directly.
///
/// Timers and spawned dispatch require a running tokio runtime.
pub struct Alarm {
    credential: String,
    max_auth_time: Duration,
    max_auth_tries: u32,
    data_file: PathBuf,
    bus: Arc<EventBus>,
    state: Mutex<Option<AlarmState>>,
    disarm_time_secs: Mutex<u64>,
    current_session: Mutex<Option<Arc<AuthSession>>>,
    sensors: Mutex<Vec<String>>,
    authenticators: Mutex<Vec<String>>,
    auth_failures: Mutex<u32>,
    auth_timeout: Oneshot,
    grace_timer: Oneshot,
    weak_self: Weak<Alarm>,
}

impl Alarm {
    pub fn new(config: &AlarmConfig, bus: Arc<EventBus>) -> Result<Arc<Self>> {
        let max_auth_time = parse_duration(&config.max_auth_time)?;
        let data_file = PathBuf::from(&config.data_file);

        if let Some(parent) = data_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                return Err(HomeguardError::persistence(format!(
                    "state directory {} does not exist",
                    parent.display()
                )));
            }
        }

        let alarm = Arc::new_cyclic(|weak_self| Self {
            credential: config.credential.clone(),
            max_auth_time,
            max_auth_tries: config.max_auth_tries,
            data_file,
            bus,
            state: Mutex::new(None),
            disarm_time_secs: Mutex::new(0),
            current_session: Mutex::new(None),
            sensors: Mutex::new(Vec::new()),
            authenticators: Mutex::new(Vec::new()),
            auth_failures: Mutex::new(0),
            auth_timeout: Oneshot::new("auth-timeout"),
            grace_timer: Oneshot::new("disarm-config-grace"),
            weak_self: weak_self.clone(),
        });

        alarm.register_event_handlers();
        Ok(alarm)
    }

    fn register_event_handlers(self: &Arc<Self>) {
        let bus = Arc::clone(&self.bus);

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::SensorStarted, move |event| {
            if let (Some(alarm), AlarmEvent::SensorStarted { name }) = (weak.upgrade(), event) {
                alarm.sensors.lock().push(name.clone());
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::SensorStopped, move |event| {
            if let (Some(alarm), AlarmEvent::SensorStopped { name }) = (weak.upgrade(), event) {
                let mut sensors = alarm.sensors.lock();
                if let Some(pos) = sensors.iter().position(|s| s == name) {
                    sensors.remove(pos);
                }
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::AuthenticatorStarted, move |event| {
            if let (Some(alarm), AlarmEvent::AuthenticatorStarted { name }) =
                (weak.upgrade(), event)
            {
                alarm.authenticators.lock().push(name.clone());
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::AuthenticatorStopped, move |event| {
            if let (Some(alarm), AlarmEvent::AuthenticatorStopped { name }) =
                (weak.upgrade(), event)
            {
                let mut authenticators = alarm.authenticators.lock();
                if let Some(pos) = authenticators.iter().position(|a| a == name) {
                    authenticators.remove(pos);
                }
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::IntrusionDetected, move |_event| {
            if let Some(alarm) = weak.upgrade() {
                alarm.on_intrusion_detected();
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::AuthenticationFailed, move |event| {
            if let (
                Some(alarm),
                AlarmEvent::AuthenticationFailed {
                    origin,
                    session,
                    reason,
                },
            ) = (weak.upgrade(), event)
            {
                alarm.on_authentication_failed(origin, session, *reason)?;
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(EventKind::AuthenticationSucceeded, move |_event| {
            if let Some(alarm) = weak.upgrade() {
                alarm.on_authentication_succeeded();
            }
            Ok(())
        });
    }

    /// On process start, restore the persisted state if present, else arm.
    ///
    /// Restoring sets the state directly: no re-persist, no event emission,
    /// no fresh authentication session.
    pub fn start(&self) -> Result<()> {
        if self.data_file.exists() {
            match self.load_persisted() {
                Ok(record) => {
                    info!(
                        "Restored alarm state {} (disarm time {}s) from {}",
                        record.state,
                        record.disarm_time,
                        self.data_file.display()
                    );
                    *self.disarm_time_secs.lock() = record.disarm_time;
                    *self.state.lock() = Some(record.state);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Could not restore alarm state from {}: {}; arming",
                        self.data_file.display(),
                        e
                    );
                }
            }
        }
        self.update_state(AlarmState::Armed, true)?;
        Ok(())
    }

    /// Commit a state transition.
    ///
    /// Returns `Ok(false)` without side effects when already in `new_state`,
    /// `InvalidTransition` when the transition table forbids it. On success
    /// the state is committed under the lock; persistence and event emission
    /// happen after the lock is released so re-entrant handlers cannot
    /// deadlock.
    pub fn update_state(&self, new_state: AlarmState, persist: bool) -> Result<bool> {
        let previous = {
            let mut state = self.state.lock();

            if *state == Some(new_state) {
                debug!("state is already {}", new_state);
                return Ok(false);
            }

            if let Some(current) = *state {
                if !current.next_states().contains(&new_state) {
                    return Err(HomeguardError::InvalidTransition {
                        from: current.name().to_string(),
                        to: new_state.name().to_string(),
                    });
                }
            }

            let previous = *state;
            *state = Some(new_state);
            previous
        };

        match previous {
            Some(previous) => info!("Changing alarm state from {} to {}", previous, new_state),
            None => info!("Setting initial alarm state to {}", new_state),
        }

        if previous == Some(AlarmState::Authenticating) {
            *self.current_session.lock() = None;
        }

        if persist {
            self.persist_state();
        }

        if new_state == AlarmState::Authenticating {
            *self.auth_failures.lock() = 0;
            let session = Arc::new(AuthSession::new(
                self.credential.clone(),
                self.max_auth_tries,
                Arc::clone(&self.bus),
            ));
            *self.current_session.lock() = Some(Arc::clone(&session));
            self.arm_auth_timeout(Arc::clone(&session));
            self.bus.emit(AlarmEvent::AlarmAuthenticating { session });
        } else {
            self.bus.emit(match new_state {
                AlarmState::Armed => AlarmEvent::AlarmArmed,
                AlarmState::Disarmed => AlarmEvent::AlarmDisarmed,
                AlarmState::Disabled => AlarmEvent::AlarmDisabled,
                AlarmState::Alarming => AlarmEvent::AlarmAlarming,
                AlarmState::Authenticating => unreachable!(),
            });
        }

        Ok(true)
    }

    /// Record the disarm duration chosen during authentication.
    ///
    /// Only legal while AUTHENTICATING. The literal `"0"` disables the alarm
    /// immediately; any other value must satisfy the duration grammar and
    /// moves the state to DISARMED. The pending authentication timeout is
    /// cancelled; the post-authentication grace timer is NOT (see
    /// `on_authentication_succeeded`).
    pub fn set_disarm_time(&self, value: &str) -> Result<()> {
        debug!("Got disarm time of {}", value);

        if self.state() != Some(AlarmState::Authenticating) {
            return Err(HomeguardError::illegal_operation(
                "cannot set disarm time, state does not allow it",
            ));
        }

        if value.trim() == "0" {
            self.auth_timeout.cancel();
            self.grace_timer.cancel();
            self.update_state(AlarmState::Disabled, true)?;
            return Ok(());
        }

        let duration = parse_duration(value)?;
        {
            let mut secs = self.disarm_time_secs.lock();
            *secs = duration.as_secs();
        }
        if let Some(session) = self.current_session() {
            session.set_disarm_secs(duration.as_secs());
        }

        self.auth_timeout.cancel();
        self.update_state(AlarmState::Disarmed, true)?;
        Ok(())
    }

    /// The stored disarm duration as a human sentence.
    pub fn readable_disarm_time(&self) -> String {
        human_time(*self.disarm_time_secs.lock())
    }

    pub fn state(&self) -> Option<AlarmState> {
        *self.state.lock()
    }

    pub fn disarm_time_secs(&self) -> u64 {
        *self.disarm_time_secs.lock()
    }

    /// Read-only handle to the in-flight authentication session, if any.
    pub fn current_session(&self) -> Option<Arc<AuthSession>> {
        self.current_session.lock().clone()
    }

    /// Names of the sensors currently registered over the bus.
    pub fn sensors(&self) -> Vec<String> {
        self.sensors.lock().clone()
    }

    /// Names of the authenticators currently registered over the bus.
    pub fn authenticators(&self) -> Vec<String> {
        self.authenticators.lock().clone()
    }

    fn on_intrusion_detected(&self) {
        match self.update_state(AlarmState::Authenticating, true) {
            Ok(_) => {}
            Err(e) => {
                // e.g. an intrusion reported while already authenticating
                error!("Could not update state to AUTHENTICATING: {}", e);
            }
        }
    }

    fn arm_auth_timeout(&self, session: Arc<AuthSession>) {
        let weak = self.weak_self.clone();
        self.auth_timeout.schedule(self.max_auth_time, move || {
            let Some(alarm) = weak.upgrade() else {
                return;
            };
            // Cancellation can race the firing; only act if this session is
            // still being authenticated.
            if alarm.state() == Some(AlarmState::Authenticating) && !session.is_authenticated() {
                alarm.bus.emit(AlarmEvent::AuthenticationFailed {
                    origin: "auth-timeout".to_string(),
                    session,
                    reason: AuthFailureReason::Timeout,
                });
            }
        });
    }

    fn on_authentication_succeeded(&self) {
        let weak = self.weak_self.clone();
        self.grace_timer.schedule(DISARM_CONFIG_GRACE, move || {
            let Some(alarm) = weak.upgrade() else {
                return;
            };
            debug!("Disarm time configuration expired, disabling the alarm");
            match alarm.update_state(AlarmState::Disabled, true) {
                Ok(_) => {}
                Err(e) => error!("Could not disable the alarm: {}", e),
            }
        });
    }

    fn on_authentication_failed(
        &self,
        origin: &str,
        session: &Arc<AuthSession>,
        reason: AuthFailureReason,
    ) -> Result<()> {
        let failures = {
            let mut failures = self.auth_failures.lock();
            *failures += 1;
            *failures
        };

        match reason {
            AuthFailureReason::MaxAuthTries | AuthFailureReason::Timeout => {
                debug!("authentication failure: {:?}", reason);
                self.end_authentication(origin, session)?;
            }
            AuthFailureReason::AuthenticatorFailure => {
                let registered = self.authenticators.lock().len() as u32;
                if registered == failures {
                    info!("No more authenticators to wait for");
                    self.end_authentication(origin, session)?;
                } else {
                    info!("Waiting for other authenticators");
                }
            }
        }
        Ok(())
    }

    fn end_authentication(&self, origin: &str, session: &Arc<AuthSession>) -> Result<()> {
        self.bus.emit(AlarmEvent::AuthenticationEnded {
            origin: origin.to_string(),
            session: Arc::clone(session),
        });
        self.update_state(AlarmState::Alarming, true)?;
        Ok(())
    }

    fn load_persisted(&self) -> Result<PersistedAlarmRecord> {
        let bytes = std::fs::read(&self.data_file)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HomeguardError::persistence(format!("malformed state file: {}", e)))
    }

    /// Whole-file overwrite of the persisted record. A write failure is
    /// logged; the in-memory state stays authoritative.
    fn persist_state(&self) {
        let Some(state) = self.state() else {
            return;
        };
        let record = PersistedAlarmRecord {
            state,
            disarm_time: *self.disarm_time_secs.lock(),
        };

        let result = serde_json::to_vec(&record)
            .map_err(|e| HomeguardError::persistence(e.to_string()))
            .and_then(|bytes| std::fs::write(&self.data_file, bytes).map_err(Into::into));

        if let Err(e) = result {
            error!(
                "Could not persist state to {}: {}",
                self.data_file.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> AlarmConfig {
        AlarmConfig {
            credential: "1234".to_string(),
            max_auth_time: "30s".to_string(),
            max_auth_tries: 3,
            data_file: dir
                .join("homeguard_state.json")
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn new_alarm(dir: &Path) -> (Arc<EventBus>, Arc<Alarm>) {
        let bus = Arc::new(EventBus::new());
        let alarm = Alarm::new(&test_config(dir), Arc::clone(&bus)).unwrap();
        (bus, alarm)
    }

    fn count_events(bus: &EventBus, kind: EventKind) -> Arc<Mutex<u32>> {
        let counter = Arc::new(Mutex::new(0u32));
        let counter_clone = Arc::clone(&counter);
        bus.subscribe(kind, move |_| {
            *counter_clone.lock() += 1;
            Ok(())
        });
        counter
    }

    #[tokio::test]
    async fn fresh_start_arms_and_persists() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        let armed = count_events(&bus, EventKind::AlarmArmed);

        alarm.start().unwrap();
        assert_eq!(alarm.state(), Some(AlarmState::Armed));
        assert_eq!(alarm.disarm_time_secs(), 0);
        assert_eq!(*armed.lock(), 1);
        assert!(dir.path().join("homeguard_state.json").exists());
    }

    #[tokio::test]
    async fn self_transition_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        let armed = count_events(&bus, EventKind::AlarmArmed);
        assert!(!alarm.update_state(AlarmState::Armed, true).unwrap());
        assert_eq!(alarm.state(), Some(AlarmState::Armed));
        assert_eq!(*armed.lock(), 0);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let (_bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        let err = alarm
            .update_state(AlarmState::Alarming, true)
            .unwrap_err();
        assert!(matches!(err, HomeguardError::InvalidTransition { .. }));
        assert_eq!(alarm.state(), Some(AlarmState::Armed));
    }

    #[tokio::test]
    async fn every_next_state_table_entry_is_honored() {
        use AlarmState::*;
        let all = [Armed, Disabled, Disarmed, Authenticating, Alarming];

        for from in all {
            for to in all {
                if from == to {
                    continue;
                }
                let dir = TempDir::new().unwrap();
                let (_bus, alarm) = new_alarm(dir.path());
                alarm.update_state(from, false).unwrap();
                let result = alarm.update_state(to, false);
                if from.next_states().contains(&to) {
                    assert!(result.unwrap(), "{} -> {} should be legal", from, to);
                } else {
                    assert!(
                        matches!(result, Err(HomeguardError::InvalidTransition { .. })),
                        "{} -> {} should be forbidden",
                        from,
                        to
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn intrusion_creates_a_session_and_emits() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        let authenticating = count_events(&bus, EventKind::AlarmAuthenticating);
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        assert_eq!(alarm.state(), Some(AlarmState::Authenticating));
        assert_eq!(*authenticating.lock(), 1);
        let session = alarm.current_session().expect("session should exist");
        assert_eq!(session.max_tries(), 3);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn repeated_intrusion_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });
        let session_id = alarm.current_session().unwrap().id();

        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });
        assert_eq!(alarm.state(), Some(AlarmState::Authenticating));
        assert_eq!(alarm.current_session().unwrap().id(), session_id);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_raises_the_alarm() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let ended = count_events(&bus, EventKind::AuthenticationEnded);
        let session = alarm.current_session().unwrap();
        for _ in 0..4 {
            assert!(!session.authenticate("telegram", "wrong"));
        }

        assert_eq!(alarm.state(), Some(AlarmState::Alarming));
        assert!(alarm.current_session().is_none());
        assert_eq!(*ended.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_timeout_raises_the_alarm() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let failed = count_events(&bus, EventKind::AuthenticationFailed);
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(*failed.lock(), 1);
        assert_eq!(alarm.state(), Some(AlarmState::Alarming));
        assert!(alarm.current_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_success_does_nothing() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let session = alarm.current_session().unwrap();
        assert!(session.authenticate("telegram", "1234"));

        let failed = count_events(&bus, EventKind::AuthenticationFailed);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*failed.lock(), 0);
        assert_eq!(alarm.state(), Some(AlarmState::Authenticating));
    }

    #[tokio::test]
    async fn authenticator_failures_wait_for_the_last_channel() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        bus.emit(AlarmEvent::AuthenticatorStarted {
            name: "telegram".to_string(),
        });
        bus.emit(AlarmEvent::AuthenticatorStarted {
            name: "twilio".to_string(),
        });
        assert_eq!(alarm.authenticators(), vec!["telegram", "twilio"]);

        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });
        let session = alarm.current_session().unwrap();

        bus.emit(AlarmEvent::AuthenticationFailed {
            origin: "telegram".to_string(),
            session: Arc::clone(&session),
            reason: AuthFailureReason::AuthenticatorFailure,
        });
        assert_eq!(alarm.state(), Some(AlarmState::Authenticating));

        bus.emit(AlarmEvent::AuthenticationFailed {
            origin: "twilio".to_string(),
            session,
            reason: AuthFailureReason::AuthenticatorFailure,
        });
        assert_eq!(alarm.state(), Some(AlarmState::Alarming));
    }

    #[tokio::test]
    async fn sensor_and_authenticator_registration_tracks_stops() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());

        bus.emit(AlarmEvent::SensorStarted {
            name: "pir".to_string(),
        });
        bus.emit(AlarmEvent::SensorStarted {
            name: "door".to_string(),
        });
        bus.emit(AlarmEvent::SensorStopped {
            name: "pir".to_string(),
        });
        // Stopping an unknown sensor is a no-op
        bus.emit(AlarmEvent::SensorStopped {
            name: "window".to_string(),
        });
        assert_eq!(alarm.sensors(), vec!["door"]);

        bus.emit(AlarmEvent::AuthenticatorStarted {
            name: "telegram".to_string(),
        });
        bus.emit(AlarmEvent::AuthenticatorStopped {
            name: "telegram".to_string(),
        });
        assert!(alarm.authenticators().is_empty());
    }

    #[tokio::test]
    async fn disarm_time_is_rejected_outside_authentication() {
        let dir = TempDir::new().unwrap();
        let (_bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        let err = alarm.set_disarm_time("1h").unwrap_err();
        assert!(matches!(err, HomeguardError::IllegalOperation { .. }));
        assert_eq!(alarm.state(), Some(AlarmState::Armed));
    }

    #[tokio::test]
    async fn disarm_time_zero_disables_immediately() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        alarm.set_disarm_time("0").unwrap();
        assert_eq!(alarm.state(), Some(AlarmState::Disabled));
        assert!(alarm.current_session().is_none());
        assert_eq!(alarm.readable_disarm_time(), "0 seconds");
    }

    #[tokio::test]
    async fn disarm_time_moves_to_disarmed_with_the_parsed_duration() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let session = alarm.current_session().unwrap();
        assert!(session.authenticate("telegram", "1234"));

        alarm.set_disarm_time("1h30m").unwrap();
        assert_eq!(alarm.state(), Some(AlarmState::Disarmed));
        assert_eq!(alarm.disarm_time_secs(), 5400);
        assert_eq!(session.disarm_secs(), 5400);
        assert_eq!(alarm.readable_disarm_time(), "1 hour, 30 minutes");
    }

    #[tokio::test]
    async fn malformed_disarm_time_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let err = alarm.set_disarm_time("soon").unwrap_err();
        assert!(matches!(err, HomeguardError::DurationParse { .. }));
        assert_eq!(alarm.state(), Some(AlarmState::Authenticating));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_disables_when_no_disarm_time_arrives() {
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let session = alarm.current_session().unwrap();
        assert!(session.authenticate("telegram", "1234"));
        assert_eq!(alarm.state(), Some(AlarmState::Authenticating));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(alarm.state(), Some(AlarmState::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_overrides_configured_disarm() {
        // Documented quirk: the 60s post-authentication grace timer is not
        // cancelled by set_disarm_time, so a configured long disarm period
        // is forced back to DISABLED when it fires.
        let dir = TempDir::new().unwrap();
        let (bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        bus.emit(AlarmEvent::IntrusionDetected {
            origin: "pir".to_string(),
        });

        let session = alarm.current_session().unwrap();
        assert!(session.authenticate("telegram", "1234"));
        alarm.set_disarm_time("4h").unwrap();
        assert_eq!(alarm.state(), Some(AlarmState::Disarmed));
        assert_eq!(alarm.disarm_time_secs(), 14_400);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(alarm.state(), Some(AlarmState::Disabled));
    }

    #[tokio::test]
    async fn persisted_state_round_trips_without_side_effects() {
        let dir = TempDir::new().unwrap();
        {
            let (bus, alarm) = new_alarm(dir.path());
            alarm.start().unwrap();
            bus.emit(AlarmEvent::IntrusionDetected {
                origin: "pir".to_string(),
            });
            let session = alarm.current_session().unwrap();
            assert!(session.authenticate("telegram", "1234"));
            alarm.set_disarm_time("2h").unwrap();
            assert_eq!(alarm.state(), Some(AlarmState::Disarmed));
        }

        let (bus, alarm) = new_alarm(dir.path());
        let disarmed = count_events(&bus, EventKind::AlarmDisarmed);
        alarm.start().unwrap();

        assert_eq!(alarm.state(), Some(AlarmState::Disarmed));
        assert_eq!(alarm.disarm_time_secs(), 7200);
        assert!(alarm.current_session().is_none());
        // Restoring must not replay the transition
        assert_eq!(*disarmed.lock(), 0);
    }

    #[tokio::test]
    async fn write_failure_keeps_the_memory_state() {
        let dir = TempDir::new().unwrap();
        // A directory at the data file path makes every write fail
        let blocked = dir.path().join("homeguard_state.json");
        std::fs::create_dir(&blocked).unwrap();

        let bus = Arc::new(EventBus::new());
        let config = AlarmConfig {
            data_file: blocked.to_string_lossy().into_owned(),
            ..test_config(dir.path())
        };
        let alarm = Alarm::new(&config, bus).unwrap();

        alarm.start().unwrap();
        assert_eq!(alarm.state(), Some(AlarmState::Armed));

        // Transitions still commit in memory when persistence fails
        assert!(alarm.update_state(AlarmState::Disarmed, true).unwrap());
        assert_eq!(alarm.state(), Some(AlarmState::Disarmed));
    }

    #[tokio::test]
    async fn corrupt_state_file_falls_back_to_armed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("homeguard_state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let (_bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();
        assert_eq!(alarm.state(), Some(AlarmState::Armed));
    }

    #[tokio::test]
    async fn persisted_record_uses_state_names() {
        let dir = TempDir::new().unwrap();
        let (_bus, alarm) = new_alarm(dir.path());
        alarm.start().unwrap();

        let raw = std::fs::read_to_string(dir.path().join("homeguard_state.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["state"], "ARMED");
        assert_eq!(value["disarm_time"], 0);
    }

    #[test]
    fn missing_state_directory_is_rejected_at_construction() {
        let bus = Arc::new(EventBus::new());
        let config = AlarmConfig {
            credential: "1234".to_string(),
            max_auth_time: "30s".to_string(),
            max_auth_tries: 3,
            data_file: "/nonexistent/homeguard/state.json".to_string(),
        };
        let Err(err) = Alarm::new(&config, bus) else {
            panic!("construction should fail without the state directory");
        };
        assert!(matches!(err, HomeguardError::Persistence { .. }));
    }
}
