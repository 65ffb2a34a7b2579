//! Rendezvous State Machine: drives a rendezvous circuit from
//! `ESTABLISH_RENDEZVOUS` through `RENDEZVOUS_ESTABLISHED` and `RENDEZVOUS2`
//! to installed end-to-end keys.
//!
//! Grounded in `rend_client_send_establish_rendezvous`,
//! `rend_client_rendezvous_acked`, and `rend_client_process_rendezvous2` from
//! the original C client.

use crate::hs_ntor::{HsNtorClientState, RendezvousAuthError};
use crate::ports::{CircOpError, CircPurpose, CircuitMap, CircuitOps, CloseReason, RendCookie};

/// Rendezvous-circuit progress, mirroring the states named in §4.5.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RendState {
    /// Waiting for `RENDEZVOUS_ESTABLISHED`.
    EstablishRend,
    /// Rendezvous point is up; waiting for `INTRODUCE_ACK`/`RENDEZVOUS2`.
    RendReady,
    /// `INTRODUCE_ACK` succeeded; still waiting for `RENDEZVOUS2`.
    ReadyIntroAcked,
    /// `RENDEZVOUS2` verified and e2e keys installed.
    RendJoined,
}

/// Per-attempt bookkeeping the driver keeps for a rendezvous circuit,
/// indexed by rendezvous cookie in the [`CircuitMap`].
pub struct RendAttempt<C> {
    /// The rendezvous circuit itself.
    pub circ: C,
    /// Current state.
    pub state: RendState,
    /// Handshake state, consumed once `RENDEZVOUS2` verifies.
    pub ntor: Option<HsNtorClientState>,
}

/// Outcome of driving the rendezvous state machine one step.
#[derive(Debug)]
pub enum RsmOutcome {
    /// `ESTABLISH_RENDEZVOUS` was sent.
    Sent,
    /// The circuit transitioned to `rend_ready`; stream attachment should be
    /// retried.
    ReadyForIntroduce,
    /// `RENDEZVOUS2` verified; e2e keys are installed and streams can now be
    /// attached.
    Joined,
    /// The rendezvous cookie had no matching circuit (already closed, or a
    /// protocol violation); nothing to do but note and ignore.
    NoSuchCircuit,
    /// A protocol violation was observed (unexpected purpose, bad cell);
    /// the circuit is being torn down.
    ProtocolViolation,
    /// The `RENDEZVOUS2` MAC failed to verify (I6): the circuit is being
    /// torn down and the attempt failed.
    AuthFailed,
}

/// Send `ESTABLISH_RENDEZVOUS` on a freshly opened rendezvous circuit and
/// register it in `circmap` under `cookie`, per §4.5's `on_rend_circuit_opens`.
pub(crate) async fn on_rend_circuit_opens<O, M>(
    ops: &O,
    circmap: &M,
    circ: O::CircId,
    cookie: RendCookie,
) -> RsmOutcome
where
    O: CircuitOps,
    M: CircuitMap<O::CircId>,
{
    match ops.send_establish_rendezvous(&circ, &cookie).await {
        Ok(()) => {
            ops.change_purpose(&circ, CircPurpose::EstablishRend);
            circmap.register_rend(cookie, circ);
            RsmOutcome::Sent
        }
        Err(CircOpError::Closed) | Err(CircOpError::Failed(_)) => {
            ops.mark_for_close(&circ, CloseReason::Internal);
            RsmOutcome::ProtocolViolation
        }
    }
}

/// Handle `RENDEZVOUS_ESTABLISHED` arriving on the circuit registered under
/// `cookie`, per §4.5's `on_rendezvous_established`.
///
/// `current_purpose` is the purpose the circuit layer reports for this
/// circuit; per the design, a `RENDEZVOUS_ESTABLISHED` on a circuit not in
/// `establish_rend` is a protocol violation.
pub(crate) fn on_rendezvous_established<O: CircuitOps>(
    ops: &O,
    circ: &O::CircId,
    current_purpose: CircPurpose,
) -> RsmOutcome {
    if current_purpose != CircPurpose::EstablishRend {
        ops.mark_for_close(circ, CloseReason::ProtocolViolation);
        return RsmOutcome::ProtocolViolation;
    }
    ops.change_purpose(circ, CircPurpose::RendReady);
    ops.pathbias_count_use_success(circ);
    RsmOutcome::ReadyForIntroduce
}

/// Handle `RENDEZVOUS2` arriving on the circuit registered under `cookie`,
/// per §4.5's `on_rendezvous2`.
///
/// `current_purpose` must be `rend_ready` or `ready_intro_acked`; the
/// "`RENDEZVOUS2` may arrive before `INTRODUCE_ACK`" shortcut from §4.5's
/// state diagram is legal and handled identically to the ordinary path,
/// since both states mean "the rendezvous point is up and we're waiting
/// for the service".
pub(crate) fn on_rendezvous2<O: CircuitOps>(
    ops: &O,
    circ: &O::CircId,
    current_purpose: CircPurpose,
    ntor: &HsNtorClientState,
    rendezvous2_payload: &[u8],
) -> RsmOutcome {
    if !matches!(
        current_purpose,
        CircPurpose::RendReady | CircPurpose::ReadyIntroAcked
    ) {
        ops.mark_for_close(circ, CloseReason::ProtocolViolation);
        return RsmOutcome::ProtocolViolation;
    }

    let seed = match ntor.client_receive_rend(rendezvous2_payload) {
        Ok(seed) => seed,
        Err(RendezvousAuthError::Malformed) => {
            ops.mark_for_close(circ, CloseReason::ProtocolViolation);
            return RsmOutcome::ProtocolViolation;
        }
        Err(RendezvousAuthError::BadMac) => {
            ops.mark_for_close(circ, CloseReason::ProtocolViolation);
            return RsmOutcome::AuthFailed;
        }
        Err(RendezvousAuthError::Internal(_)) => {
            ops.mark_for_close(circ, CloseReason::Internal);
            return RsmOutcome::ProtocolViolation;
        }
    };

    let Ok(keystream_seed) = seed.expand(72) else {
        ops.mark_for_close(circ, CloseReason::Internal);
        return RsmOutcome::ProtocolViolation;
    };

    if ops.setup_e2e_keys(circ, &keystream_seed).is_err() {
        ops.mark_for_close(circ, CloseReason::Internal);
        return RsmOutcome::ProtocolViolation;
    }

    ops.change_purpose(circ, CircPurpose::RendJoined);
    RsmOutcome::Joined
}

/// Update a rendezvous attempt's state after its matching `INTRODUCE_ACK`
/// succeeds but `RENDEZVOUS2` hasn't arrived yet: `rend_ready` becomes
/// `ready_intro_acked`. If `RENDEZVOUS2` already arrived and joined the
/// circuit, this is a no-op (the legal early-arrival shortcut from §4.5).
pub(crate) fn on_introduce_acked<C>(attempt: &mut RendAttempt<C>) {
    if attempt.state == RendState::RendReady {
        attempt.state = RendState::ReadyIntroAcked;
    }
}
