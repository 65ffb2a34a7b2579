//! Introduction State Machine: drives an introduction circuit from
//! "extending towards the intro point" through `INTRODUCE1`/`INTRODUCE_ACK`
//! to either success (handed off to the rendezvous side) or a fresh
//! extension attempt.
//!
//! Grounded in `send_introduce1`, `handle_introduce_ack*`,
//! `close_or_reextend_intro_circ`, and `client_get_random_intro` from the
//! original C client.

use tor_hscrypto::Subcredential;
use tor_linkspec::OwnedCircTarget;
use tor_llcrypto::pk::ed25519::Ed25519Identity;
use tor_netdoc::doc::hsdesc::IntroPointDesc;

use crate::clock::Clock;
use crate::config::HsClientConnectorConfig;
use crate::ipfc::{FailureKind, Ipfc};
use crate::ports::{CircOpError, CircPurpose, CircuitOps, IntroPointResolver, RandomSource, RendCookie};

/// Parsed result of an `INTRODUCE_ACK` cell's single status byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntroduceAckStatus {
    /// Status 0: the service accepted the introduction.
    Success,
    /// Status 1: the service rejected it.
    Failure,
    /// The cell could not be parsed.
    BadFmt,
    /// Status 2: no relay with that identity.
    NoRelay,
    /// Any other status code; fail-closed (§9 open question: preserved as
    /// documented teacher behavior rather than treated as failure).
    Unknown,
}

impl IntroduceAckStatus {
    /// Parse a raw `INTRODUCE_ACK` status byte.
    pub fn from_status_byte(b: u8) -> Self {
        match b {
            0 => IntroduceAckStatus::Success,
            1 => IntroduceAckStatus::Failure,
            2 => IntroduceAckStatus::NoRelay,
            _ => IntroduceAckStatus::Unknown,
        }
    }
}

/// Outcome of driving the introduction state machine one step.
#[derive(Debug)]
pub enum IsmOutcome {
    /// `INTRODUCE1` was sent; the circuit is now in ack_wait.
    Sent,
    /// A transient condition (missing descriptor, or no usable introduction
    /// point left in the one we have) occurred; the caller should refetch
    /// and re-park streams. The circuit is untouched.
    TransientNeedRefetch,
    /// A permanent per-circuit failure occurred; both circuits should be
    /// considered closing.
    PermanentFailure,
    /// `INTRODUCE_ACK` succeeded; caller should look up the rendezvous
    /// circuit by cookie and transition it.
    AckSuccess,
    /// The intro circuit was re-extended in place to a new introduction
    /// point; the caller should retry `send_introduce1` against it using
    /// the new intro point.
    ReExtended {
        /// The introduction point the circuit was extended to.
        new_intro: IntroPointDesc,
        /// Its resolved `CircTarget`.
        new_target: OwnedCircTarget,
    },
    /// The old intro circuit's `RELAY_EARLY` budget was exhausted (or the
    /// extend itself failed), so it was closed; the caller must build a
    /// brand-new intro circuit to the given introduction point instead of
    /// re-extending.
    NeedFreshIntroCircuit {
        /// The introduction point to build a fresh circuit towards.
        new_intro: IntroPointDesc,
        /// Its resolved `CircTarget`.
        new_target: OwnedCircTarget,
    },
    /// No usable intro point remained; both legs are being closed.
    ClosedBothLegs,
    /// Unknown ack status: log and ignore, leave circuit in ack_wait.
    UnknownAckIgnored,
}

/// Everything the introduction state machine needs to know about the
/// descriptor for one service, abstracted so it doesn't depend on how the
/// descriptor cache stores things.
pub trait DescriptorView {
    /// All introduction points currently advertised for this service.
    fn intro_points(&self) -> &[IntroPointDesc];
    /// The service's current subcredential.
    fn subcredential(&self) -> &Subcredential;
}

/// Select a usable, non-excluded introduction point at random, per §4.4.2.
///
/// Returns the chosen intro point descriptor and its `CircTarget`, or
/// `None` if no usable intro point exists under the current policy.
pub(crate) fn pick_random_intro<D: DescriptorView, C: Clock>(
    desc: &D,
    service_id: tor_hscrypto::pk::HsId,
    ipfc: &Ipfc<C>,
    config: &HsClientConnectorConfig,
    resolver: &dyn IntroPointResolver,
    rng: &dyn RandomSource,
) -> Option<(IntroPointDesc, OwnedCircTarget)> {
    let mut candidates: Vec<&IntroPointDesc> = desc.intro_points().iter().collect();
    // Fisher-Yates via repeated removal, driven by the abstract RandomSource
    // so tests can make the "random" choice deterministic.
    let mut order = Vec::with_capacity(candidates.len());
    while !candidates.is_empty() {
        let idx = rng.crypto_rand_below(candidates.len());
        order.push(candidates.remove(idx));
    }

    let mut excluded_fallback: Option<(IntroPointDesc, OwnedCircTarget)> = None;

    for ipt in order {
        let sid_key: &tor_llcrypto::pk::ed25519::PublicKey = ipt.ipt_sid_key();
        let auth_key = Ed25519Identity::from(sid_key);
        if !ipfc.is_usable(service_id, auth_key) {
            continue;
        }
        let target = match resolver.resolve(ipt) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if is_excluded(&target, config) {
            excluded_fallback = Some((ipt.clone(), target));
            continue;
        }
        return Some((ipt.clone(), target));
    }

    if config.strict_nodes {
        None
    } else {
        excluded_fallback
    }
}

/// Whether any introduction point in `desc` is currently usable per the
/// IPFC's failure-count policy, regardless of whether it also resolves to a
/// valid `CircTarget` or passes the exclusion list.
///
/// Used to tell "have a descriptor, but it's exhausted" apart from "don't
/// have a descriptor at all" -- both need a refetch, per §4.4.
fn any_intro_point_usable<D: DescriptorView, C: Clock>(
    desc: &D,
    service_id: tor_hscrypto::pk::HsId,
    ipfc: &Ipfc<C>,
) -> bool {
    desc.intro_points().iter().any(|ipt| {
        let sid_key: &tor_llcrypto::pk::ed25519::PublicKey = ipt.ipt_sid_key();
        ipfc.is_usable(service_id, Ed25519Identity::from(sid_key))
    })
}

/// Whether `target`'s known identities intersect the configured exclusion
/// set.
fn is_excluded(target: &OwnedCircTarget, config: &HsClientConnectorConfig) -> bool {
    let ids = tor_linkspec::RelayIds::from_relay_ids(target);
    config.exclude_nodes.contains(&ids)
}

/// Send `INTRODUCE1` on `intro_circ`, per §4.4's `send_introduce1`.
///
/// `desc` and `rng` are the descriptor and randomness collaborators; `ops`
/// performs the actual cell construction/transmission.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn send_introduce1<O, D, C>(
    ops: &O,
    intro_circ: &O::CircId,
    rend_cookie: &RendCookie,
    rend_target: &OwnedCircTarget,
    service_id: tor_hscrypto::pk::HsId,
    desc: Option<&D>,
    chosen_intro: &IntroPointDesc,
    ipfc: &Ipfc<C>,
) -> IsmOutcome
where
    O: CircuitOps,
    D: DescriptorView,
    C: Clock,
{
    let Some(desc) = desc else {
        return IsmOutcome::TransientNeedRefetch;
    };

    // No descriptor at all and "descriptor present but every intro point in
    // it is IPFC-exhausted" both mean the same thing to our caller: go
    // refetch and re-park waiting streams, rather than failing this attempt
    // outright.
    if !any_intro_point_usable(desc, service_id, ipfc) {
        return IsmOutcome::TransientNeedRefetch;
    }

    let chosen_sid: &tor_llcrypto::pk::ed25519::PublicKey = chosen_intro.ipt_sid_key();
    let found = desc.intro_points().iter().find(|ipt| {
        let sid: &tor_llcrypto::pk::ed25519::PublicKey = ipt.ipt_sid_key();
        sid.as_bytes() == chosen_sid.as_bytes()
    });
    let Some(_ipt) = found else {
        return IsmOutcome::PermanentFailure;
    };

    match ops
        .send_introduce1(
            intro_circ,
            rend_cookie,
            rend_target,
            chosen_intro,
            desc.subcredential(),
        )
        .await
    {
        Ok(()) => {
            ops.change_purpose(intro_circ, CircPurpose::AckWait);
            ops.pathbias_count_use_attempt(intro_circ);
            IsmOutcome::Sent
        }
        Err(CircOpError::Closed) | Err(CircOpError::Failed(_)) => {
            let _ = ipfc; // ipfc noting for this path happens at the ack layer per design
            IsmOutcome::PermanentFailure
        }
    }
}

/// Handle an `INTRODUCE_ACK` status byte arriving on `intro_circ`, per
/// §4.4's "On `INTRODUCE_ACK`" rules.
///
/// On a failure status, this drives `close_or_reextend_intro_circ` itself
/// rather than leaving that to the caller, so the re-extend policy (reuse
/// the intro circuit when its `RELAY_EARLY` budget allows it) is always
/// applied.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn on_introduce_ack<O, D, C>(
    ops: &O,
    intro_circ: &O::CircId,
    rend_circ: &O::CircId,
    service_id: tor_hscrypto::pk::HsId,
    intro_auth_pk: Ed25519Identity,
    status: IntroduceAckStatus,
    desc: Option<&D>,
    ipfc: &Ipfc<C>,
    config: &HsClientConnectorConfig,
    resolver: &dyn IntroPointResolver,
    rng: &dyn RandomSource,
) -> IsmOutcome
where
    O: CircuitOps,
    D: DescriptorView,
    C: Clock,
{
    match status {
        IntroduceAckStatus::Success => {
            ops.change_purpose(intro_circ, CircPurpose::Acked);
            ops.mark_for_close(intro_circ, crate::ports::CloseReason::Finished);
            ops.pathbias_count_use_success(intro_circ);
            IsmOutcome::AckSuccess
        }
        IntroduceAckStatus::Failure | IntroduceAckStatus::BadFmt | IntroduceAckStatus::NoRelay => {
            ipfc.note(service_id, intro_auth_pk, FailureKind::Generic);
            close_or_reextend(
                ops, intro_circ, rend_circ, desc, service_id, ipfc, config, resolver, rng,
            )
            .await
        }
        IntroduceAckStatus::Unknown => IsmOutcome::UnknownAckIgnored,
    }
}

/// Implements `close_or_reextend_intro_circ`: given that the previous
/// intro point just failed, either re-extend to a fresh one in place or
/// give up on both circuits.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn close_or_reextend<O, D, C>(
    ops: &O,
    intro_circ: &O::CircId,
    rend_circ: &O::CircId,
    desc: Option<&D>,
    service_id: tor_hscrypto::pk::HsId,
    ipfc: &Ipfc<C>,
    config: &HsClientConnectorConfig,
    resolver: &dyn IntroPointResolver,
    rng: &dyn RandomSource,
) -> IsmOutcome
where
    O: CircuitOps,
    D: DescriptorView,
    C: Clock,
{
    let Some(desc) = desc else {
        ops.mark_for_close(intro_circ, crate::ports::CloseReason::Finished);
        ops.mark_for_close(rend_circ, crate::ports::CloseReason::Finished);
        return IsmOutcome::ClosedBothLegs;
    };

    let Some((new_intro, new_target)) =
        pick_random_intro(desc, service_id, ipfc, config, resolver, rng)
    else {
        ops.mark_for_close(intro_circ, crate::ports::CloseReason::Finished);
        ops.mark_for_close(rend_circ, crate::ports::CloseReason::Finished);
        return IsmOutcome::ClosedBothLegs;
    };

    if ops.remaining_relay_early_cells(intro_circ) == 0 {
        ops.mark_for_close(intro_circ, crate::ports::CloseReason::Finished);
        return IsmOutcome::NeedFreshIntroCircuit {
            new_intro,
            new_target,
        };
    }

    match ops.extend_to_new_exit(intro_circ, &new_target).await {
        Ok(()) => {
            ops.change_purpose(intro_circ, CircPurpose::Introducing);
            IsmOutcome::ReExtended {
                new_intro,
                new_target,
            }
        }
        Err(_) => {
            ops.mark_for_close(intro_circ, crate::ports::CloseReason::Finished);
            IsmOutcome::NeedFreshIntroCircuit {
                new_intro,
                new_target,
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    use std::sync::Mutex;

    use tor_proto::circuit::ClientCirc;

    use crate::ports::CloseReason;
    use crate::relay_info::InvalidTarget;

    #[test]
    fn ack_status_parses_known_codes() {
        assert_eq!(IntroduceAckStatus::from_status_byte(0), IntroduceAckStatus::Success);
        assert_eq!(IntroduceAckStatus::from_status_byte(1), IntroduceAckStatus::Failure);
        assert_eq!(IntroduceAckStatus::from_status_byte(2), IntroduceAckStatus::NoRelay);
        assert_eq!(IntroduceAckStatus::from_status_byte(200), IntroduceAckStatus::Unknown);
    }

    // As in `crate::connect`'s tests: there's no way anywhere in this
    // workspace to hand-construct a real `IntroPointDesc` (it's only ever
    // built internally by `tor-netdoc`'s own parser), so these tests use an
    // empty `intro_points` list and only cover the "no usable introduction
    // point remains" branch of `close_or_reextend`. The "re-extend
    // succeeded"/"re-extend needs a fresh circuit" branches that return a
    // concrete `IntroPointDesc` are exercised structurally by reading the
    // code, not by a running test.

    #[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
    struct FakeCircId(u64);

    #[derive(Default)]
    struct FakeOps {
        closed: Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl CircuitOps for FakeOps {
        type CircId = FakeCircId;

        async fn send_introduce1(
            &self,
            _intro_circ: &Self::CircId,
            _rend_cookie: &RendCookie,
            _rend_target: &OwnedCircTarget,
            _intro_point: &IntroPointDesc,
            _subcredential: &Subcredential,
        ) -> Result<(), CircOpError> {
            unreachable!("not exercised by these tests")
        }

        async fn send_establish_rendezvous(
            &self,
            _circ: &Self::CircId,
            _cookie: &RendCookie,
        ) -> Result<(), CircOpError> {
            unreachable!("not exercised by these tests")
        }

        fn setup_e2e_keys(&self, _circ: &Self::CircId, _seed: &[u8]) -> Result<(), CircOpError> {
            unreachable!("not exercised by these tests")
        }

        async fn extend_to_new_exit(
            &self,
            _circ: &Self::CircId,
            _target: &OwnedCircTarget,
        ) -> Result<(), CircOpError> {
            unreachable!("not exercised by these tests: no usable intro point is ever chosen")
        }

        fn change_purpose(&self, _circ: &Self::CircId, _purpose: CircPurpose) {}

        fn mark_for_close(&self, circ: &Self::CircId, _reason: CloseReason) {
            self.closed.lock().unwrap().push(circ.0);
        }

        fn pathbias_count_use_attempt(&self, _circ: &Self::CircId) {}
        fn pathbias_count_use_success(&self, _circ: &Self::CircId) {}

        fn remaining_relay_early_cells(&self, _circ: &Self::CircId) -> u32 {
            3
        }

        async fn build_intro_circuit(
            &self,
            _target: &OwnedCircTarget,
        ) -> Result<Self::CircId, CircOpError> {
            unreachable!("not exercised by these tests")
        }

        async fn build_rendezvous_circuit(
            &self,
        ) -> Result<(Self::CircId, OwnedCircTarget), CircOpError> {
            unreachable!("not exercised by these tests")
        }

        async fn await_rendezvous_established(&self, _circ: &Self::CircId) -> Result<(), CircOpError> {
            unreachable!("not exercised by these tests")
        }

        async fn await_introduce_ack(&self, _intro_circ: &Self::CircId) -> Result<u8, CircOpError> {
            unreachable!("not exercised by these tests")
        }

        async fn await_rendezvous2(&self, _rend_circ: &Self::CircId) -> Result<Vec<u8>, CircOpError> {
            unreachable!("not exercised by these tests")
        }

        fn take_client_circ(&self, _circ: &Self::CircId) -> Result<ClientCirc, CircOpError> {
            unreachable!("not exercised by these tests")
        }
    }

    struct UnreachableResolver;
    impl IntroPointResolver for UnreachableResolver {
        fn resolve(&self, _desc: &IntroPointDesc) -> Result<OwnedCircTarget, InvalidTarget> {
            unreachable!("not exercised by these tests")
        }
    }

    struct FixedRng;
    impl RandomSource for FixedRng {
        fn crypto_rand_below(&self, bound: usize) -> usize {
            if bound == 0 {
                0
            } else {
                bound - 1
            }
        }
    }

    struct EmptyDescriptor {
        subcred: Subcredential,
    }
    impl DescriptorView for EmptyDescriptor {
        fn intro_points(&self) -> &[IntroPointDesc] {
            &[]
        }
        fn subcredential(&self) -> &Subcredential {
            &self.subcred
        }
    }

    fn test_hsid() -> tor_hscrypto::pk::HsId {
        Ed25519Identity::from([1; 32]).into()
    }

    /// With no descriptor at all, `close_or_reextend` must close both legs
    /// rather than leaving the intro circuit dangling.
    #[test]
    fn close_or_reextend_closes_both_legs_with_no_descriptor() {
        futures::executor::block_on(async {
            let ops = FakeOps::default();
            let ipfc = Ipfc::new(crate::clock::SystemClock);
            let config = HsClientConnectorConfig::default();

            let outcome = close_or_reextend::<_, EmptyDescriptor, _>(
                &ops,
                &FakeCircId(1),
                &FakeCircId(2),
                None,
                test_hsid(),
                &ipfc,
                &config,
                &UnreachableResolver,
                &FixedRng,
            )
            .await;

            assert!(matches!(outcome, IsmOutcome::ClosedBothLegs));
            let closed = ops.closed.lock().unwrap();
            assert!(closed.contains(&1));
            assert!(closed.contains(&2));
        });
    }

    /// With a descriptor present but no usable introduction point left in
    /// it, `close_or_reextend` must still close both legs instead of
    /// panicking or hanging -- this is the branch that stands in for the
    /// "re-extend target resolution fails" path, since resolution is never
    /// reached with an empty intro-point list.
    #[test]
    fn close_or_reextend_closes_both_legs_with_no_usable_intro_point() {
        futures::executor::block_on(async {
            let ops = FakeOps::default();
            let ipfc = Ipfc::new(crate::clock::SystemClock);
            let config = HsClientConnectorConfig::default();
            let desc = EmptyDescriptor {
                subcred: [0; 32].into(),
            };

            let outcome = close_or_reextend(
                &ops,
                &FakeCircId(1),
                &FakeCircId(2),
                Some(&desc),
                test_hsid(),
                &ipfc,
                &config,
                &UnreachableResolver,
                &FixedRng,
            )
            .await;

            assert!(matches!(outcome, IsmOutcome::ClosedBothLegs));
        });
    }
}
