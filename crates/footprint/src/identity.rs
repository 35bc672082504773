//! Per-slot anonymized network identity and its connectivity state machine.

use crate::error::{CollectError, CollectResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

pub const DEFAULT_ROTATION_CEILING: u32 = 50;

/// An outbound identity: one HTTP client bound to the slot's proxy.
///
/// Never edited in place. Rotation drops the handle and opens a new one with
/// the next `generation`, so pooled connections from the old circuit cannot
/// leak into requests made under the new identity.
#[derive(Clone, Debug)]
pub struct Identity {
    pub slot: u16,
    pub generation: u32,
    pub proxy: Option<String>,
    client: reqwest::Client,
}

impl Identity {
    pub fn new(slot: u16, generation: u32, proxy: Option<String>, client: reqwest::Client) -> Self {
        Self {
            slot,
            generation,
            proxy,
            client,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityState {
    Disconnected,
    Verifying,
    Connected,
    /// Terminal: the rotation ceiling was hit.
    Failed,
}

/// The anonymizing network a controller drives.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Opens a fresh identity handle for `slot`.
    fn open(&self, slot: u16, generation: u32) -> CollectResult<Identity>;

    /// Issues the reachability probe through `identity`.
    async fn probe(&self, identity: &Identity) -> CollectResult<()>;

    /// Asks the circuit for a new exit identity. Returns how long to wait
    /// before the new identity is safe to use.
    async fn request_new_identity(&self, slot: u16) -> CollectResult<Duration>;
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerSettings {
    pub rotation_ceiling: u32,
    /// Pause used when the control channel itself fails to rotate.
    pub control_error_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            rotation_ceiling: DEFAULT_ROTATION_CEILING,
            control_error_backoff: Duration::from_secs(1),
        }
    }
}

/// Owns the identity of one worker slot.
pub struct IdentityController<B> {
    slot: u16,
    backend: B,
    settings: ControllerSettings,
    state: IdentityState,
    identity: Option<Identity>,
    generation: u32,
    rotations_total: u64,
}

impl<B: IdentityBackend> IdentityController<B> {
    pub fn new(slot: u16, backend: B, settings: ControllerSettings) -> Self {
        Self {
            slot,
            backend,
            settings,
            state: IdentityState::Disconnected,
            identity: None,
            generation: 0,
            rotations_total: 0,
        }
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn state(&self) -> IdentityState {
        self.state
    }

    /// Circuit rotations requested over the controller's lifetime.
    pub fn rotations_total(&self) -> u64 {
        self.rotations_total
    }

    /// The identity to issue requests through.
    ///
    /// Calling this before [`connect`](Self::connect) succeeded is a bug in
    /// the caller and is reported as `NotConnected`.
    pub fn current(&self) -> CollectResult<&Identity> {
        match (&self.state, &self.identity) {
            (IdentityState::Connected, Some(identity)) => Ok(identity),
            _ => Err(CollectError::NotConnected { slot: self.slot }),
        }
    }

    /// Probes until an identity works, rotating the circuit after each
    /// failure. Gives up after `rotation_ceiling` failed rotations and moves
    /// to the terminal `Failed` state.
    pub async fn connect(&mut self) -> CollectResult<&Identity> {
        if self.state == IdentityState::Failed {
            return Err(self.exhausted());
        }
        if self.state == IdentityState::Connected && self.identity.is_some() {
            return self.current();
        }

        let mut failed_rotations = 0u32;
        loop {
            self.state = IdentityState::Verifying;
            let identity = self.backend.open(self.slot, self.generation)?;
            let probe = self.backend.probe(&identity).await;
            match probe {
                Ok(()) => {
                    tracing::info!(
                        slot = self.slot,
                        generation = self.generation,
                        rotations = failed_rotations,
                        "Connection established"
                    );
                    self.state = IdentityState::Connected;
                    self.identity = Some(identity);
                    return self.current();
                }
                Err(e) => {
                    if failed_rotations >= self.settings.rotation_ceiling {
                        self.state = IdentityState::Failed;
                        tracing::error!(
                            slot = self.slot,
                            rotations = failed_rotations,
                            error = %e,
                            "Cannot reach the network through proxy; giving up"
                        );
                        return Err(self.exhausted());
                    }
                    tracing::debug!(slot = self.slot, rotations = failed_rotations, error = %e, "Probe failed");
                    drop(identity);
                    self.rotate_circuit().await;
                    failed_rotations += 1;
                }
            }
        }
    }

    /// Forces a new exit identity and blocks until it is verified.
    pub async fn rotate(&mut self) -> CollectResult<&Identity> {
        if self.state == IdentityState::Failed {
            return Err(self.exhausted());
        }
        tracing::info!(slot = self.slot, "Requesting new identity");
        self.identity = None;
        self.state = IdentityState::Disconnected;
        self.rotate_circuit().await;
        self.connect().await
    }

    async fn rotate_circuit(&mut self) {
        let wait = match self.backend.request_new_identity(self.slot).await {
            Ok(wait) => wait,
            Err(e) => {
                tracing::warn!(slot = self.slot, error = %e, "Identity rotation request failed");
                self.settings.control_error_backoff
            }
        };
        self.generation = self.generation.wrapping_add(1);
        self.rotations_total += 1;
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    fn exhausted(&self) -> CollectError {
        CollectError::ConnectivityExhausted {
            slot: self.slot,
            rotations: self.settings.rotation_ceiling,
        }
    }
}
