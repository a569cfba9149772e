//! Phase Barrier
//!
//! Reusable async barrier with dynamic registration and an advance callback.
//!
//! ```text
//!   phase N                         advancing                 phase N+1
//!   ┌──────────────┐  last arrival  ┌──────────────────┐      ┌──────────────┐
//!   │ parties      │ ─────────────► │ on_advance(N)    │ ───► │ unarrived =  │
//!   │ register /   │                │ registrations    │      │   parties    │
//!   │ arrive       │                │ and arrivals wait│      │ waiters wake │
//!   └──────────────┘                └──────────────────┘      └──────────────┘
//! ```
//!
//! The callback for phase N completes before any waiter on phase N is
//! released, and runs exactly once per phase. A party registering while the
//! callback runs joins phase N+1.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Invoked with the completed phase number when a phase advances
pub type AdvanceCallback = Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default)]
struct BarrierState {
    phase: u64,
    parties: usize,
    unarrived: usize,
    advancing: bool,
    terminated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseSignal {
    phase: u64,
    terminated: bool,
}

struct Inner {
    state: Mutex<BarrierState>,
    signal: watch::Sender<PhaseSignal>,
    on_advance: Option<AdvanceCallback>,
}

/// Cloneable handle to a shared phase barrier
#[derive(Clone)]
pub struct PhaseBarrier {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PhaseBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseBarrier")
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl Default for PhaseBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseBarrier {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Barrier that awaits `callback` on every advance
    pub fn with_callback(callback: AdvanceCallback) -> Self {
        Self::build(Some(callback))
    }

    fn build(on_advance: Option<AdvanceCallback>) -> Self {
        let (signal, _rx) = watch::channel(PhaseSignal {
            phase: 0,
            terminated: false,
        });
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BarrierState::default()),
                signal,
                on_advance,
            }),
        }
    }

    pub fn phase(&self) -> u64 {
        self.inner.state.lock().phase
    }

    pub fn registered_parties(&self) -> usize {
        self.inner.state.lock().parties
    }

    pub fn unarrived_parties(&self) -> usize {
        self.inner.state.lock().unarrived
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated
    }

    /// Add a party to the current phase, returning that phase.
    ///
    /// Waits out an in-progress advance so the party lands in the next phase.
    pub async fn register(&self) -> Result<u64> {
        loop {
            let (phase, mut rx) = {
                let mut state = self.inner.state.lock();
                if state.terminated {
                    return Err(Error::BarrierTerminated { phase: state.phase });
                }
                if !state.advancing {
                    state.parties += 1;
                    state.unarrived += 1;
                    return Ok(state.phase);
                }
                (state.phase, self.inner.signal.subscribe())
            };

            let _ = rx
                .wait_for(|s| s.phase != phase || s.terminated)
                .await;
        }
    }

    /// Register and return a guard that arrives on drop if never arrived explicitly
    pub async fn join(&self) -> Result<Party> {
        let phase = self.register().await?;
        Ok(Party {
            barrier: self.clone(),
            phase,
            arrived: false,
        })
    }

    /// Arrive without waiting; returns the phase arrived at
    pub async fn arrive(&self) -> Result<u64> {
        self.arrive_inner(false).await
    }

    /// Arrive and drop out of future phases; returns the phase arrived at
    pub async fn arrive_and_deregister(&self) -> Result<u64> {
        self.arrive_inner(true).await
    }

    /// Arrive and wait for the phase to advance; returns the new phase
    pub async fn arrive_and_await_advance(&self) -> Result<u64> {
        let phase = self.arrive_inner(false).await?;
        self.await_advance(phase).await
    }

    /// Wait until the barrier leaves `phase`.
    ///
    /// Returns immediately if it already has. Fails if the barrier is
    /// terminated before advancing.
    pub async fn await_advance(&self, phase: u64) -> Result<u64> {
        let mut rx = self.inner.signal.subscribe();
        let signal = *rx
            .wait_for(|s| s.phase != phase || s.terminated)
            .await
            .map_err(|_| Error::BarrierTerminated { phase })?;

        if signal.phase != phase {
            Ok(signal.phase)
        } else {
            Err(Error::BarrierTerminated { phase })
        }
    }

    /// Terminate the barrier, releasing every waiter with an error
    pub fn force_termination(&self) {
        let mut state = self.inner.state.lock();
        if state.terminated {
            return;
        }
        state.terminated = true;
        self.inner.signal.send_replace(PhaseSignal {
            phase: state.phase,
            terminated: true,
        });
        debug!("Phase barrier terminated at phase {}", state.phase);
    }

    async fn arrive_inner(&self, deregister: bool) -> Result<u64> {
        loop {
            let (phase, mut rx) = {
                let mut state = self.inner.state.lock();
                if state.terminated {
                    return Err(Error::BarrierTerminated { phase: state.phase });
                }
                if !state.advancing {
                    if state.unarrived == 0 {
                        return Err(Error::Internal(format!(
                            "arrival at phase {} without a registered party",
                            state.phase
                        )));
                    }

                    let phase = state.phase;
                    state.unarrived -= 1;
                    if deregister {
                        state.parties -= 1;
                    }
                    if state.unarrived == 0 {
                        state.advancing = true;
                        drop(state);
                        self.spawn_advance(phase);
                    }
                    return Ok(phase);
                }
                (state.phase, self.inner.signal.subscribe())
            };

            let _ = rx
                .wait_for(|s| s.phase != phase || s.terminated)
                .await;
        }
    }

    /// Runs detached so a cancelled arriver cannot stall the phase
    fn spawn_advance(&self, phase: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(callback) = &inner.on_advance {
                if AssertUnwindSafe(callback(phase))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("Advance callback panicked at phase {}", phase);
                }
            }

            let mut state = inner.state.lock();
            state.advancing = false;
            if state.terminated {
                return;
            }
            state.phase = phase + 1;
            state.unarrived = state.parties;
            inner.signal.send_replace(PhaseSignal {
                phase: state.phase,
                terminated: false,
            });
            debug!("Phase barrier advanced to {} ({} parties)", state.phase, state.parties);
        });
    }
}

// =============================================================================
// Party Guard
// =============================================================================

/// A registered party that deregisters itself if dropped before arriving
#[must_use]
pub struct Party {
    barrier: PhaseBarrier,
    phase: u64,
    arrived: bool,
}

impl Party {
    /// Phase this party registered into
    pub fn phase(&self) -> u64 {
        self.phase
    }

    pub async fn arrive_and_deregister(mut self) -> Result<u64> {
        let result = self.barrier.arrive_and_deregister().await;
        self.arrived = true;
        result
    }
}

impl Drop for Party {
    fn drop(&mut self) {
        if self.arrived {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let barrier = self.barrier.clone();
                handle.spawn(async move {
                    if let Err(e) = barrier.arrive_and_deregister().await {
                        debug!("Dropped party could not arrive: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "Party for phase {} dropped outside a runtime without arriving",
                self.phase
            ),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
