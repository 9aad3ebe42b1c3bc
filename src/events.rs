use crate::error::Result;
use crate::session::{AuthFailureReason, AuthSession};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The closed set of event names components may subscribe to or emit.
/// Adding a name means extending this enumeration, never ad hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SensorStarted,
    SensorStopped,
    AuthenticatorStarted,
    AuthenticatorStopped,
    IntrusionDetected,
    AuthenticationFailed,
    AuthenticationSucceeded,
    AuthenticationEnded,
    AlarmAuthenticating,
    AlarmAlarming,
    AlarmDisarmed,
    AlarmDisabled,
    AlarmArmed,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SensorStarted => "sensor_started",
            EventKind::SensorStopped => "sensor_stopped",
            EventKind::AuthenticatorStarted => "authenticator_started",
            EventKind::AuthenticatorStopped => "authenticator_stopped",
            EventKind::IntrusionDetected => "intrusion_detected",
            EventKind::AuthenticationFailed => "authentication_failed",
            EventKind::AuthenticationSucceeded => "authentication_succeeded",
            EventKind::AuthenticationEnded => "authentication_ended",
            EventKind::AlarmAuthenticating => "alarm_authenticating",
            EventKind::AlarmAlarming => "alarm_alarming",
            EventKind::AlarmDisarmed => "alarm_disarmed",
            EventKind::AlarmDisabled => "alarm_disabled",
            EventKind::AlarmArmed => "alarm_armed",
        }
    }
}

/// Events that can occur in the alarm system, with their payloads.
#[derive(Debug, Clone)]
pub enum AlarmEvent {
    /// A sensor agent registered itself
    SensorStarted { name: String },
    /// A sensor agent unregistered itself
    SensorStopped { name: String },
    /// An authenticator agent registered itself
    AuthenticatorStarted { name: String },
    /// An authenticator agent unregistered itself
    AuthenticatorStopped { name: String },
    /// A sensor reported an intrusion
    IntrusionDetected { origin: String },
    /// An authentication attempt or channel failed
    AuthenticationFailed {
        origin: String,
        session: Arc<AuthSession>,
        reason: AuthFailureReason,
    },
    /// The expected credential was presented
    AuthenticationSucceeded {
        origin: String,
        session: Arc<AuthSession>,
    },
    /// The authentication exchange is over, success or not
    AuthenticationEnded {
        origin: String,
        session: Arc<AuthSession>,
    },
    /// The alarm entered AUTHENTICATING with a fresh session
    AlarmAuthenticating { session: Arc<AuthSession> },
    /// The alarm entered ALARMING
    AlarmAlarming,
    /// The alarm entered DISARMED
    AlarmDisarmed,
    /// The alarm entered DISABLED
    AlarmDisabled,
    /// The alarm entered ARMED
    AlarmArmed,
}

impl AlarmEvent {
    /// Get the event kind this payload belongs to
    pub fn kind(&self) -> EventKind {
        match self {
            AlarmEvent::SensorStarted { .. } => EventKind::SensorStarted,
            AlarmEvent::SensorStopped { .. } => EventKind::SensorStopped,
            AlarmEvent::AuthenticatorStarted { .. } => EventKind::AuthenticatorStarted,
            AlarmEvent::AuthenticatorStopped { .. } => EventKind::AuthenticatorStopped,
            AlarmEvent::IntrusionDetected { .. } => EventKind::IntrusionDetected,
            AlarmEvent::AuthenticationFailed { .. } => EventKind::AuthenticationFailed,
            AlarmEvent::AuthenticationSucceeded { .. } => EventKind::AuthenticationSucceeded,
            AlarmEvent::AuthenticationEnded { .. } => EventKind::AuthenticationEnded,
            AlarmEvent::AlarmAuthenticating { .. } => EventKind::AlarmAuthenticating,
            AlarmEvent::AlarmAlarming => EventKind::AlarmAlarming,
            AlarmEvent::AlarmDisarmed => EventKind::AlarmDisarmed,
            AlarmEvent::AlarmDisabled => EventKind::AlarmDisabled,
            AlarmEvent::AlarmArmed => EventKind::AlarmArmed,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            AlarmEvent::SensorStarted { name } => format!("Sensor {} started", name),
            AlarmEvent::SensorStopped { name } => format!("Sensor {} stopped", name),
            AlarmEvent::AuthenticatorStarted { name } => {
                format!("Authenticator {} started", name)
            }
            AlarmEvent::AuthenticatorStopped { name } => {
                format!("Authenticator {} stopped", name)
            }
            AlarmEvent::IntrusionDetected { origin } => {
                format!("Intrusion detected by {}", origin)
            }
            AlarmEvent::AuthenticationFailed {
                origin, reason, ..
            } => format!("Authentication failed from {}: {:?}", origin, reason),
            AlarmEvent::AuthenticationSucceeded { origin, session } => {
                format!("Authentication succeeded from {} (session {})", origin, session.id())
            }
            AlarmEvent::AuthenticationEnded { session, .. } => {
                format!("Authentication ended (session {})", session.id())
            }
            AlarmEvent::AlarmAuthenticating { session } => {
                format!("Alarm authenticating (session {})", session.id())
            }
            AlarmEvent::AlarmAlarming => "Alarm alarming".to_string(),
            AlarmEvent::AlarmDisarmed => "Alarm disarmed".to_string(),
            AlarmEvent::AlarmDisabled => "Alarm disabled".to_string(),
            AlarmEvent::AlarmArmed => "Alarm armed".to_string(),
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// Run inline before `emit` returns, in subscription order
    Inline,
    /// Run on a spawned task; the emitter gets no result or ordering
    Spawned,
}

type HandlerFn = dyn Fn(&AlarmEvent) -> Result<()> + Send + Sync;

struct Subscriber {
    id: SubscriptionId,
    mode: DispatchMode,
    handler: Arc<HandlerFn>,
}

/// In-process publish/subscribe registry keyed by event kind.
///
/// Constructed explicitly and injected into components; there is no ambient
/// global instance. Handlers subscribed inline run synchronously from the
/// emitting call site in subscription order; handlers subscribed as
/// fire-and-forget run on spawned tasks. A handler error or panic is caught
/// and logged, never interrupting delivery to the remaining handlers.
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
    spawned_in_flight: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            spawned_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe an inline handler for an event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AlarmEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.add_subscriber(kind, DispatchMode::Inline, Arc::new(handler))
    }

    /// Subscribe a fire-and-forget handler dispatched on a spawned task.
    /// Requires a tokio runtime at emission time.
    pub fn subscribe_spawned<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AlarmEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.add_subscriber(kind, DispatchMode::Spawned, Arc::new(handler))
    }

    fn add_subscriber(
        &self,
        kind: EventKind,
        mode: DispatchMode,
        handler: Arc<HandlerFn>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, mode, handler });
        debug!("Subscribed handler {:?} to {}", id, kind.name());
        id
    }

    /// Remove a handler. Removing one that is not subscribed is a no-op.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let Some(pos) = list.iter().position(|s| s.id == id) else {
            return false;
        };
        list.remove(pos);
        debug!("Unsubscribed handler {:?} from {}", id, kind.name());
        true
    }

    /// Deliver an event to every handler currently subscribed to its kind.
    pub fn emit(&self, event: AlarmEvent) {
        match &event {
            AlarmEvent::IntrusionDetected { origin } => {
                warn!("Intrusion detected by {}", origin);
            }
            AlarmEvent::AuthenticationFailed { origin, reason, .. } => {
                warn!("Authentication failed from {}: {:?}", origin, reason);
            }
            AlarmEvent::AlarmAlarming => {
                warn!("Alarm is now alarming");
            }
            AlarmEvent::AuthenticationSucceeded { origin, .. } => {
                info!("Authentication succeeded from {}", origin);
            }
            _ => {
                debug!("Event: {}", event.description());
            }
        }

        // Snapshot the handler list so handlers can subscribe, unsubscribe
        // or emit re-entrantly without deadlocking on the registry lock.
        let snapshot: Vec<(SubscriptionId, DispatchMode, Arc<HandlerFn>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(&event.kind())
                .map(|list| {
                    list.iter()
                        .map(|s| (s.id, s.mode, Arc::clone(&s.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, mode, handler) in snapshot {
            match mode {
                DispatchMode::Inline => Self::invoke(id, &handler, &event),
                DispatchMode::Spawned => {
                    let event = event.clone();
                    let in_flight = Arc::clone(&self.spawned_in_flight);
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        Self::invoke(id, &handler, &event);
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }

    fn invoke(id: SubscriptionId, handler: &Arc<HandlerFn>, event: &AlarmEvent) {
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    "Handler {:?} failed for {}: {}",
                    id,
                    event.kind().name(),
                    e
                );
            }
            Err(_) => {
                error!("Handler {:?} panicked for {}", id, event.kind().name());
            }
        }
    }

    /// Number of handlers subscribed to a kind
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .lock()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of fire-and-forget handlers currently running
    pub fn spawned_in_flight(&self) -> usize {
        self.spawned_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
