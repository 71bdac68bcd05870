//! Registration lifecycle and delegation sync against the lookup service.
//!
//! The manager owns the node's lookup identity and drives two things: a
//! one-time registration with bounded exponential backoff, and the periodic
//! delegation sync that replaces the store's delegation set wholesale. A
//! failed sync leaves the current set untouched; a node marked inactive has
//! every delegation revoked but keeps its identity and keeps polling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::LookupError;
use crate::lookup::LookupClient;
use crate::store::{DelegationDiff, DelegationSet, TrixelStore};

/// Exponential backoff, doubling per attempt up to a cap, with up to 20%
/// jitter so restarting nodes do not hammer the lookup service in lockstep.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Backoff {
        Backoff {
            initial,
            cap,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.2))
    }
}

/// Assigned lookup identity. Held from the first successful registration
/// onward, including while deactivated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: u64,
    pub token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPhase {
    Unregistered,
    Registering,
    Registered,
    Deactivated,
    RegistrationFailed,
}

/// Registration status for the node's status surface. Never carries the
/// API token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RegistrationStatus {
    pub phase: RegistrationPhase,
    pub attempt: u32,
    pub id: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Host address announced at registration.
    pub host: String,
    pub sync_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub max_register_attempts: u32,
    /// Identity carried over from an earlier registration, if any.
    pub identity: Option<NodeIdentity>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncReport {
    pub active: bool,
    pub diff: DelegationDiff,
}

struct ManagerState {
    phase: RegistrationPhase,
    attempt: u32,
    identity: Option<NodeIdentity>,
}

pub struct DelegationManager {
    client: Arc<dyn LookupClient>,
    store: Arc<TrixelStore>,
    settings: SyncSettings,
    state: RwLock<ManagerState>,
    // Serializes registration so concurrent callers never overlap sign-ups.
    register_lock: tokio::sync::Mutex<()>,
}

impl DelegationManager {
    pub fn new(
        client: Arc<dyn LookupClient>,
        store: Arc<TrixelStore>,
        settings: SyncSettings,
    ) -> DelegationManager {
        let identity = settings.identity.clone();
        // A carried-over identity is assumed deactivated until the first
        // sync says otherwise.
        let phase = if identity.is_some() {
            RegistrationPhase::Deactivated
        } else {
            RegistrationPhase::Unregistered
        };
        DelegationManager {
            client,
            store,
            settings,
            state: RwLock::new(ManagerState {
                phase,
                attempt: 0,
                identity,
            }),
            register_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> Option<NodeIdentity> {
        self.state.read().identity.clone()
    }

    pub fn phase(&self) -> RegistrationPhase {
        self.state.read().phase
    }

    /// Registered and currently marked active by the lookup service.
    pub fn is_active(&self) -> bool {
        self.phase() == RegistrationPhase::Registered
    }

    pub fn status(&self) -> RegistrationStatus {
        let state = self.state.read();
        RegistrationStatus {
            phase: state.phase,
            attempt: state.attempt,
            id: state.identity.as_ref().map(|identity| identity.id),
        }
    }

    /// Sign up with the lookup service unless an identity is already held.
    /// Retries with backoff up to the configured attempt limit, then gives
    /// up for good.
    pub async fn ensure_registered(&self) -> Result<NodeIdentity, LookupError> {
        let _guard = self.register_lock.lock().await;
        if let Some(identity) = self.identity() {
            return Ok(identity);
        }

        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_cap);
        for attempt in 1..=self.settings.max_register_attempts {
            {
                let mut state = self.state.write();
                state.phase = RegistrationPhase::Registering;
                state.attempt = attempt;
            }
            match self.client.register(&self.settings.host).await {
                Ok(registration) => {
                    info!(
                        id = registration.id,
                        active = registration.active,
                        "registered with the lookup service"
                    );
                    let identity = NodeIdentity {
                        id: registration.id,
                        token: registration.token,
                    };
                    let mut state = self.state.write();
                    state.identity = Some(identity.clone());
                    state.phase = if registration.active {
                        RegistrationPhase::Registered
                    } else {
                        RegistrationPhase::Deactivated
                    };
                    return Ok(identity);
                }
                Err(err) if attempt < self.settings.max_register_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "registration failed, backing off"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    error!(attempt, error = %err, "registration failed, giving up");
                }
            }
        }
        self.state.write().phase = RegistrationPhase::RegistrationFailed;
        Err(LookupError::RegistrationFailed {
            attempts: self.settings.max_register_attempts,
        })
    }

    /// One sync round. The pulled delegation set replaces the current one
    /// wholesale; trixels that fell out of coverage are torn down inside
    /// that swap. On failure nothing changes.
    pub async fn sync_once(&self) -> Result<SyncReport, LookupError> {
        let identity = self.ensure_registered().await?;
        let answer = self
            .client
            .sync_delegation(identity.id, &identity.token)
            .await?;

        let was_active = self.phase() == RegistrationPhase::Registered;
        if !answer.active {
            let diff = self.store.apply_delegation(DelegationSet::default());
            self.state.write().phase = RegistrationPhase::Deactivated;
            if was_active {
                warn!("deactivated by the lookup service, revoking all delegations");
            }
            return Ok(SyncReport {
                active: false,
                diff,
            });
        }

        let diff = self
            .store
            .apply_delegation(DelegationSet::from_grants(answer.delegations));
        self.state.write().phase = RegistrationPhase::Registered;
        if !was_active {
            info!("marked active by the lookup service");
        }
        if !diff.is_noop() {
            info!(
                granted = ?diff.granted,
                revoked = ?diff.revoked,
                keys_removed = diff.keys_removed,
                "delegation set changed"
            );
        }
        Ok(SyncReport { active: true, diff })
    }

    /// Register, then sync on the configured interval until the task is
    /// dropped. Sync failures back off and leave the delegation set as it
    /// was.
    pub async fn run(&self) -> Result<(), LookupError> {
        self.ensure_registered().await?;
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_cap);
        loop {
            match self.sync_once().await {
                Ok(_) => {
                    backoff.reset();
                    sleep(self.settings.sync_interval).await;
                }
                Err(LookupError::AuthRejected) => {
                    let delay = backoff.next_delay();
                    error!(
                        delay_ms = delay.as_millis() as u64,
                        "lookup service rejected our credential, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "delegation sync failed"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
