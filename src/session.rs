use crate::events::{AlarmEvent, EventBus};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Why an authentication exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureReason {
    /// An authenticator mechanism itself failed, e.g. a challenge could not
    /// be delivered
    AuthenticatorFailure,
    /// No successful authentication within the configured window
    Timeout,
    /// The session's retry budget is exhausted
    MaxAuthTries,
}

#[derive(Debug)]
struct SessionInner {
    tries: u32,
    authenticated: bool,
    disarm_secs: u64,
}

enum AttemptOutcome {
    Success,
    WrongCredential,
    AlreadyAuthenticated,
    BudgetExhausted,
    AlreadyExhausted,
}

/// A single challenge/response exchange tied to one intrusion event.
///
/// Safe for concurrent attempts from multiple authenticators racing to
/// authenticate the same session. The attempt counter and authenticated flag
/// mutate under the session lock; events are emitted after it is released.
pub struct AuthSession {
    id: Uuid,
    credential: String,
    max_tries: u32,
    bus: Arc<EventBus>,
    inner: Mutex<SessionInner>,
}

impl AuthSession {
    pub fn new(credential: String, max_tries: u32, bus: Arc<EventBus>) -> Self {
        Self {
            id: Uuid::new_v4(),
            credential,
            max_tries,
            bus,
            inner: Mutex::new(SessionInner {
                tries: 0,
                authenticated: false,
                disarm_secs: 0,
            }),
        }
    }

    /// Submit a credential attempt from `origin`.
    ///
    /// Every call increments the attempt counter, including calls made after
    /// the session already authenticated; those keep returning false without
    /// re-emitting, so the correct credential returns true exactly once. The
    /// first attempt past the retry budget emits
    /// `authentication_failed(MaxAuthTries)`; later ones fail silently. The
    /// caller decides whether to keep prompting based on `remaining_tries`.
    pub fn authenticate(self: &Arc<Self>, origin: &str, candidate: &str) -> bool {
        let outcome = {
            let mut inner = self.inner.lock();
            inner.tries += 1;
            if inner.tries > self.max_tries {
                if inner.tries == self.max_tries + 1 {
                    AttemptOutcome::BudgetExhausted
                } else {
                    AttemptOutcome::AlreadyExhausted
                }
            } else if inner.authenticated {
                AttemptOutcome::AlreadyAuthenticated
            } else if candidate == self.credential {
                inner.authenticated = true;
                AttemptOutcome::Success
            } else {
                AttemptOutcome::WrongCredential
            }
        };

        match outcome {
            AttemptOutcome::Success => {
                self.bus.emit(AlarmEvent::AuthenticationSucceeded {
                    origin: origin.to_string(),
                    session: Arc::clone(self),
                });
                self.bus.emit(AlarmEvent::AuthenticationEnded {
                    origin: origin.to_string(),
                    session: Arc::clone(self),
                });
                true
            }
            AttemptOutcome::WrongCredential => {
                debug!(
                    "Wrong credential from {} on session {}, {} tries remaining",
                    origin,
                    self.id,
                    self.remaining_tries()
                );
                false
            }
            AttemptOutcome::BudgetExhausted => {
                self.bus.emit(AlarmEvent::AuthenticationFailed {
                    origin: origin.to_string(),
                    session: Arc::clone(self),
                    reason: AuthFailureReason::MaxAuthTries,
                });
                false
            }
            AttemptOutcome::AlreadyAuthenticated => {
                debug!(
                    "Attempt from {} on already authenticated session {}",
                    origin, self.id
                );
                false
            }
            AttemptOutcome::AlreadyExhausted => false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    pub fn tries(&self) -> u32 {
        self.inner.lock().tries
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn remaining_tries(&self) -> u32 {
        self.max_tries.saturating_sub(self.inner.lock().tries)
    }

    /// Disarm duration chosen during this session, in seconds
    pub fn disarm_secs(&self) -> u64 {
        self.inner.lock().disarm_secs
    }

    pub fn set_disarm_secs(&self, secs: u64) {
        self.inner.lock().disarm_secs = secs;
    }
}

impl fmt::Debug for AuthSession {
    // Never prints the expected credential
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AuthSession")
            .field("id", &self.id)
            .field("tries", &inner.tries)
            .field("max_tries", &self.max_tries)
            .field("authenticated", &inner.authenticated)
            .finish()
    }
}
