//! Per-wallet-per-chain nonce allocation
//!
//! Each (wallet, chain) key is an independent critical section: one in-flight
//! holder at a time, waiters served strictly in arrival order. Different keys
//! never contend. The lock is handed off directly to the next waiter on
//! release, so a late arrival can never barge ahead of the queue.
//!
//! Leases release on drop. A tick task cancelled mid-flight therefore cannot
//! strand the key and deadlock every later acquirer.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{is_nonce_related, Error, Result};
use crate::provider::ChainProvider;
use crate::wallet::WalletFarm;

const DEFAULT_SYNC_COOLDOWN: Duration = Duration::from_secs(5);

/// Wakeup signal delivered to a queued acquirer
#[derive(Debug)]
enum WaiterSignal {
    /// The lock has been handed to you; take the next nonce
    Granted,
    /// The queue was cleared after a forced re-sync; re-enter acquisition
    Resync,
}

#[derive(Debug)]
struct SlotState {
    initialized: bool,
    current: u64,
    locked: bool,
    last_synced: Option<Instant>,
    waiters: VecDeque<oneshot::Sender<WaiterSignal>>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            initialized: false,
            current: 0,
            locked: false,
            last_synced: None,
            waiters: VecDeque::new(),
        }
    }
}

type Slot = Arc<Mutex<SlotState>>;

/// Debug snapshot of one wallet-chain key, for operational dashboards
#[derive(Debug, Clone, serde::Serialize)]
pub struct NonceSlotDebug {
    pub current: u64,
    pub locked: bool,
    pub waiters: usize,
    pub initialized: bool,
    pub last_synced_ms_ago: Option<u64>,
}

/// Exclusive hold on one wallet-chain nonce sequence.
///
/// The allocated nonce stays reserved until the lease is released or dropped.
#[derive(Debug)]
pub struct NonceLease {
    nonce: u64,
    wallet: u32,
    chain: String,
    slot: Slot,
    released: bool,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Explicitly release the key (equivalent to dropping the lease)
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_slot(&self.slot, self.wallet, &self.chain);
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Unlock a key, handing the lock to the oldest live waiter if any
fn release_slot(slot: &Slot, wallet: u32, chain: &str) {
    let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
    if !state.locked {
        // Logic error in the caller, reported but not fatal
        warn!(wallet, chain, "Nonce release called while unlocked");
        return;
    }
    loop {
        match state.waiters.pop_front() {
            Some(tx) => {
                // Handoff: the lock stays held, ownership moves to the waiter.
                // A send failure means the waiter was cancelled; try the next.
                if tx.send(WaiterSignal::Granted).is_ok() {
                    return;
                }
            }
            None => {
                state.locked = false;
                return;
            }
        }
    }
}

/// Allocates strictly-increasing nonces per wallet-chain key
pub struct NonceManager {
    farm: Arc<WalletFarm>,
    provider: Arc<dyn ChainProvider>,
    slots: DashMap<(u32, String), Slot>,
    sync_cooldown: Duration,
}

impl NonceManager {
    pub fn new(farm: Arc<WalletFarm>, provider: Arc<dyn ChainProvider>) -> Self {
        Self::with_cooldown(farm, provider, DEFAULT_SYNC_COOLDOWN)
    }

    pub fn with_cooldown(
        farm: Arc<WalletFarm>,
        provider: Arc<dyn ChainProvider>,
        sync_cooldown: Duration,
    ) -> Self {
        Self {
            farm,
            provider,
            slots: DashMap::new(),
            sync_cooldown,
        }
    }

    fn slot(&self, wallet: u32, chain: &str) -> Slot {
        self.slots
            .entry((wallet, chain.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(SlotState::new())))
            .clone()
    }

    /// Acquire the next nonce for a wallet-chain key.
    ///
    /// Returns immediately if the key is free, otherwise queues FIFO behind
    /// the current holder. The first acquirer of a key initializes it from
    /// the provider's pending nonce; an initialization failure poisons only
    /// this attempt, not the key or any other key.
    pub async fn acquire(&self, wallet: u32, chain: &str) -> Result<NonceLease> {
        let slot = self.slot(wallet, chain);

        loop {
            let waiter = {
                let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
                if !state.locked {
                    state.locked = true;
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            };

            match waiter {
                None => break,
                Some(rx) => match rx.await {
                    Ok(WaiterSignal::Granted) => break,
                    Ok(WaiterSignal::Resync) => continue,
                    // Sender dropped without a signal; start over
                    Err(_) => continue,
                },
            }
        }

        // We hold the key's lock from here on.
        if let Err(e) = self.ensure_initialized(&slot, wallet, chain).await {
            release_slot(&slot, wallet, chain);
            return Err(e);
        }

        let nonce = {
            let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
            let nonce = state.current;
            state.current += 1;
            nonce
        };

        debug!(wallet, chain, nonce, "Nonce acquired");

        Ok(NonceLease {
            nonce,
            wallet,
            chain: chain.to_string(),
            slot,
            released: false,
        })
    }

    /// Explicit release for callers not using the lease.
    ///
    /// Releasing an unlocked key is a logic error (logged, not fatal).
    pub fn release(&self, wallet: u32, chain: &str) {
        let slot = self.slot(wallet, chain);
        release_slot(&slot, wallet, chain);
    }

    /// Initialize `current` from the on-chain pending nonce. Caller must hold
    /// the key's lock; the mutex is dropped across the provider await since
    /// the logical lock already excludes concurrent mutation.
    async fn ensure_initialized(&self, slot: &Slot, wallet: u32, chain: &str) -> Result<()> {
        {
            let state = slot.lock().unwrap_or_else(|e| e.into_inner());
            if state.initialized {
                return Ok(());
            }
        }

        let address = self.farm.address(wallet)?;
        let pending = self
            .provider
            .pending_nonce(chain, &address)
            .await
            .map_err(|e| Error::NonceInit {
                wallet,
                chain: chain.to_string(),
                reason: e.to_string(),
            })?;

        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
        state.current = pending;
        state.initialized = true;
        state.last_synced = Some(Instant::now());
        info!(wallet, chain, pending, "Nonce state initialized from chain");
        Ok(())
    }

    /// Re-read the on-chain pending nonce and overwrite local state.
    ///
    /// Throttled by the cooldown window unless `force` is set, to avoid
    /// hammering the provider. Resets the lock; a queued waiter is handed
    /// the fresh sequence in FIFO order.
    pub async fn sync(&self, wallet: u32, chain: &str, force: bool) -> Result<u64> {
        let slot = self.slot(wallet, chain);

        if !force {
            let state = slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = state.last_synced {
                if at.elapsed() < self.sync_cooldown {
                    debug!(wallet, chain, "Nonce sync skipped (cooldown)");
                    return Ok(state.current);
                }
            }
        }

        let address = self.farm.address(wallet)?;
        let pending = self.provider.pending_nonce(chain, &address).await?;

        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
        state.current = pending;
        state.initialized = true;
        state.last_synced = Some(Instant::now());
        state.locked = false;
        // Hand the fresh sequence to the oldest surviving waiter
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(WaiterSignal::Granted).is_ok() {
                state.locked = true;
                break;
            }
        }
        info!(wallet, chain, pending, "Nonce state synced from chain");
        Ok(pending)
    }

    /// React to a submission error that may indicate a stale local nonce.
    ///
    /// Matches nonce-too-low / replacement-underpriced / generic nonce
    /// mentions. On a match the key is force-synced and the waiter queue is
    /// cleared (queued positions are stale); cleared waiters transparently
    /// re-enter acquisition. Returns whether recovery happened.
    pub async fn handle_nonce_error(&self, wallet: u32, chain: &str, error: &Error) -> Result<bool> {
        if !is_nonce_related(&error.to_string()) {
            return Ok(false);
        }

        warn!(wallet, chain, error = %error, "Nonce conflict detected, forcing re-sync");

        let address = self.farm.address(wallet)?;
        let pending = self.provider.pending_nonce(chain, &address).await?;

        let slot = self.slot(wallet, chain);
        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
        state.current = pending;
        state.initialized = true;
        state.last_synced = Some(Instant::now());
        state.locked = false;
        let stale: Vec<_> = state.waiters.drain(..).collect();
        drop(state);

        for tx in stale {
            let _ = tx.send(WaiterSignal::Resync);
        }

        info!(wallet, chain, pending, "Nonce recovery complete");
        Ok(true)
    }

    /// Snapshot of every tracked key, for dashboards
    pub fn debug_state(&self) -> HashMap<String, NonceSlotDebug> {
        self.slots
            .iter()
            .map(|entry| {
                let (wallet, chain) = entry.key();
                let state = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                (
                    format!("wallet{}:{}", wallet, chain),
                    NonceSlotDebug {
                        current: state.current,
                        locked: state.locked,
                        waiters: state.waiters.len(),
                        initialized: state.initialized,
                        last_synced_ms_ago: state.last_synced.map(|t| t.elapsed().as_millis() as u64),
                    },
                )
            })
            .collect()
    }
}
