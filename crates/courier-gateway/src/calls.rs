use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use uuid::Uuid;

use courier_types::events::ServerEvent;

use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    Ringing,
    Active,
}

#[derive(Debug, Clone, Copy)]
struct PairState {
    peer: Uuid,
    phase: CallPhase,
}

/// Forwards call-setup handshakes between two identified sessions,
/// keeping just enough state to auto-reject conflicting offers.
///
/// Payloads are opaque — the relay routes them without inspection, and
/// none of them are durable: an offline target simply never sees the
/// event. The state table is a plain mutex held only for map access;
/// pushes always happen after it is released.
#[derive(Clone)]
pub struct CallRelay {
    registry: Registry,
    states: Arc<Mutex<HashMap<Uuid, PairState>>>,
}

impl CallRelay {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Forward an offer, unless the callee is already ringing or active
    /// with a different party — then the caller gets an immediate
    /// busy-termination and the callee never hears about it.
    pub async fn offer(&self, caller: Uuid, callee: Uuid, payload: serde_json::Value) {
        let busy = {
            let mut states = self.lock();
            match states.get(&callee) {
                Some(state) if state.peer != caller => true,
                _ => {
                    states.insert(
                        caller,
                        PairState {
                            peer: callee,
                            phase: CallPhase::Ringing,
                        },
                    );
                    states.insert(
                        callee,
                        PairState {
                            peer: caller,
                            phase: CallPhase::Ringing,
                        },
                    );
                    false
                }
            }
        };

        if busy {
            info!("call offer {} -> {}: callee busy", caller, callee);
            self.registry
                .push(
                    caller,
                    ServerEvent::CallEnd {
                        from: callee,
                        reason: Some("busy".into()),
                    },
                )
                .await;
            return;
        }

        self.registry
            .push(callee, ServerEvent::CallOffer { from: caller, payload })
            .await;
    }

    /// Forward an answer and move the pair to active — but only if a
    /// matching outstanding offer exists. Anything else is dropped.
    pub async fn answer(&self, callee: Uuid, caller: Uuid, payload: serde_json::Value) {
        let matched = {
            let mut states = self.lock();
            let outstanding = matches!(
                states.get(&caller),
                Some(state) if state.peer == callee && state.phase == CallPhase::Ringing
            );
            if outstanding {
                states.insert(
                    caller,
                    PairState {
                        peer: callee,
                        phase: CallPhase::Active,
                    },
                );
                states.insert(
                    callee,
                    PairState {
                        peer: caller,
                        phase: CallPhase::Active,
                    },
                );
            }
            outstanding
        };

        if !matched {
            debug!("call answer {} -> {} without outstanding offer, dropped", callee, caller);
            return;
        }

        self.registry
            .push(caller, ServerEvent::CallAnswer { from: callee, payload })
            .await;
    }

    /// Forward an ICE candidate while the pair is in any non-idle
    /// state. No retry, no queueing — signaling is not durable.
    pub async fn ice_candidate(&self, from: Uuid, to: Uuid, payload: serde_json::Value) {
        let in_call = {
            let states = self.lock();
            matches!(states.get(&from), Some(state) if state.peer == to)
        };

        if !in_call {
            debug!("ice candidate {} -> {} outside a call, dropped", from, to);
            return;
        }

        self.registry
            .push(to, ServerEvent::CallIceCandidate { from, payload })
            .await;
    }

    /// Forward a termination and reset the pair to idle. Safe to call
    /// from any state, including idle.
    pub async fn end(&self, from: Uuid, to: Uuid) {
        {
            let mut states = self.lock();
            if matches!(states.get(&from), Some(state) if state.peer == to) {
                states.remove(&from);
            }
            if matches!(states.get(&to), Some(state) if state.peer == from) {
                states.remove(&to);
            }
        }

        self.registry
            .push(to, ServerEvent::CallEnd { from, reason: None })
            .await;
    }

    /// Disconnect cleanup: reset any pair involving `user` and tell the
    /// peer, so a vanished party cannot wedge the other side in busy.
    pub async fn hangup_for(&self, user: Uuid) {
        let peer = {
            let mut states = self.lock();
            let Some(state) = states.remove(&user) else {
                return;
            };
            if matches!(states.get(&state.peer), Some(back) if back.peer == user) {
                states.remove(&state.peer);
            }
            state.peer
        };

        self.registry
            .push(peer, ServerEvent::CallEnd { from: user, reason: None })
            .await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PairState>> {
        self.states.lock().expect("call state lock poisoned")
    }
}
