//! Main implementation of the connection functionality: wires together the
//! descriptor cache, fetch scheduler, intro-point failure cache, and the
//! introduction/rendezvous state machines into a single connection attempt.

use std::time::SystemTime;

use async_trait::async_trait;
use rand::RngCore as _;

use tor_hscrypto::pk::HsId;
use tor_hscrypto::Subcredential;
use tor_llcrypto::pk::ed25519::Ed25519Identity;
use tor_netdoc::doc::hsdesc::IntroPointDesc;
use tor_proto::circuit::ClientCirc;
use tor_rtcompat::Runtime;

use crate::clock::Clock;
use crate::config::HsClientConnectorConfig;
use crate::err::{DescriptorError, FailedAttemptError, IntroPtIndex};
use crate::fetch::FetchStatus;
use crate::hs_ntor::HsNtorClientState;
use crate::ipfc::Ipfc;
use crate::ism::{self, DescriptorView, IntroduceAckStatus, IsmOutcome};
use crate::ports::{CircOpError, CircPurpose, CircuitMap, CircuitOps, DirIdent, IntroPointResolver, RandomSource};
use crate::rsm::{self, RsmOutcome};
use crate::state::MockableConnectorData;
use crate::streams::CheckedDescriptor;
use crate::{HsClientConnError, HsClientConnector, HsClientSecretKeys};

/// A descriptor, as assembled by a [`crate::ports::DescriptorParser`]
/// implementation, carrying the extra bookkeeping the descriptor cache
/// needs to re-validate it over time.
#[derive(Clone, Debug)]
pub struct ParsedDescriptor {
    /// The descriptor format version.
    pub version: u8,
    /// The blinded key this descriptor's signing certificate was issued
    /// under.
    pub cert_blinded_key: Ed25519Identity,
    /// When the signing certificate stops being valid.
    pub cert_valid_until: SystemTime,
    /// The advertised introduction points.
    pub intro_points: Vec<IntroPointDesc>,
    /// The service's current subcredential.
    pub subcredential: Subcredential,
}

impl DescriptorView for ParsedDescriptor {
    fn intro_points(&self) -> &[IntroPointDesc] {
        &self.intro_points
    }
    fn subcredential(&self) -> &Subcredential {
        &self.subcredential
    }
}

impl CheckedDescriptor for ParsedDescriptor {
    fn version(&self) -> u8 {
        self.version
    }
    fn signing_cert_valid(&self, blinded_key: &Ed25519Identity, now: SystemTime) -> bool {
        &self.cert_blinded_key == blinded_key && now < self.cert_valid_until
    }
}

/// Per-connection scratch state.
///
/// The shared caches (descriptor cache, fetch scheduler, intro-point
/// failure cache) live on [`HsClientConnector`] itself, since they're keyed
/// by service identity rather than by the `(secret_keys, isolation)` tuple
/// this record is attached to; this type only needs to exist so that
/// [`MockableConnectorData`] has somewhere to hang its associated types.
#[derive(Default, Debug)]
pub struct Data {}

/// Actually make a HS connection, updating our recorded state as necessary.
///
/// `connector` is provided only for obtaining the runtime, netdir, and the
/// shared per-service caches. Obviously, `connect` is not supposed to go
/// looking in `services`.
///
/// This function handles all necessary retrying of fallible operations
/// (and, therefore, must also limit the total work done for a particular
/// call), per the design's "Terminal-per-request" error tier.
pub(crate) async fn connect<R: Runtime>(
    connector: &HsClientConnector<R>,
    hsid: HsId,
    _data: &mut Data,
    secret_keys: HsClientSecretKeys,
) -> Result<ClientCirc, HsClientConnError> {
    let _ = secret_keys; // client auth is carried by the descriptor/introduce layer, not here

    let netdir = connector
        .netdir_provider
        .timely_netdir()
        .map_err(|_| HsClientConnError::NoHsDirs)?;

    let descriptor = obtain_descriptor(connector, hsid).await?;

    let mut attempts = Vec::new();
    for attempt in 0..crate::state::MAX_ATTEMPTS {
        let result = try_once(
            &*connector.circ_ops,
            connector.rend_map.as_ref(),
            &connector.ipfc,
            &connector.config(),
            &netdir,
            connector.rng.as_ref(),
            hsid,
            &descriptor,
            attempt,
        )
        .await;
        match result {
            Ok(circ) => {
                crate::streams::on_connection_attempt_succeeded(&connector.fetch, hsid);
                return Ok(circ);
            }
            Err(e) => attempts.push(tor_error::Report(e)),
        }
    }
    Err(HsClientConnError::Failed(retry_error::RetryError::from_iter(
        "connecting to onion service",
        attempts,
    )))
}

/// Ensure a validated, usable descriptor for `hsid` is cached, fetching one
/// if necessary.
async fn obtain_descriptor<R: Runtime>(
    connector: &HsClientConnector<R>,
    hsid: HsId,
) -> Result<ParsedDescriptor, HsClientConnError> {
    if let Some(desc) = connector.dcv.lookup(hsid) {
        return Ok(desc);
    }

    let Some((blinded_key, time_period)) = connector.dirinfo.blinded_key_and_period(hsid) else {
        return Err(HsClientConnError::NoHsDirs);
    };
    let Some(subcredential) = connector.dirinfo.subcredential_for(hsid) else {
        return Err(HsClientConnError::NoHsDirs);
    };

    let mut attempts = Vec::new();
    for _ in 0..crate::state::MAX_ATTEMPTS {
        let (status, launch) = connector.fetch.refetch(
            &connector.config(),
            connector.dirinfo.as_ref(),
            hsid,
            blinded_key,
            time_period,
            false,
        );
        match status {
            FetchStatus::HaveDesc => unreachable!("just checked dcv.lookup above"),
            FetchStatus::NotAllowed => return Err(HsClientConnError::NoUsableIntroPoints),
            FetchStatus::NoHsDirs | FetchStatus::MissingInfo => {
                return Err(HsClientConnError::NoHsDirs)
            }
            FetchStatus::Error => {
                return Err(HsClientConnError::Bug(tor_error::internal!(
                    "fetch scheduler reported an internal error"
                )))
            }
            FetchStatus::Pending => continue,
            FetchStatus::Launched => {
                let (hsdir, resource) = launch.expect("Launched always carries a target");
                let ident = DirIdent {
                    service_id: hsid,
                    blinded_key,
                    time_period,
                };
                let result = connector
                    .dir_ops
                    .launch_anonymous_dir_fetch(resource, ident)
                    .await;
                connector.fetch.fetch_completed(hsid);
                let bytes = match result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        attempts.push(tor_error::Report(DescriptorError {
                            hsdir: hsdir.into(),
                            error: e.into(),
                        }));
                        continue;
                    }
                };
                let parsed = match connector.parser.decode(&bytes, &subcredential) {
                    Ok(d) => d,
                    Err(e) => {
                        attempts.push(tor_error::Report(DescriptorError {
                            hsdir: hsdir.into(),
                            error: e.into(),
                        }));
                        continue;
                    }
                };
                match connector
                    .dcv
                    .store(hsid, blinded_key, SystemTime::now(), parsed.clone())
                {
                    Ok(()) => return Ok(parsed),
                    Err(rejected) => {
                        attempts.push(tor_error::Report(DescriptorError {
                            hsdir: hsdir.into(),
                            error: rejected.into(),
                        }));
                        continue;
                    }
                }
            }
        }
    }
    Err(HsClientConnError::DescriptorDownload(
        retry_error::RetryError::from_iter("fetching onion service descriptor", attempts),
    ))
}

/// One attempt: pick an intro point, build circuits in parallel, introduce
/// (re-extending the same intro circuit to a fresh introduction point on
/// failure, per §4.4's re-extend policy), and rendezvous.
///
/// Takes its collaborators directly, rather than a whole [`HsClientConnector`],
/// so it can be driven against fakes in tests the same way [`crate::rsm`] and
/// [`crate::ism`] are.
#[allow(clippy::too_many_arguments)]
async fn try_once<O, M, C>(
    ops: &O,
    rend_map: &M,
    ipfc: &Ipfc<C>,
    config: &HsClientConnectorConfig,
    resolver: &dyn IntroPointResolver,
    rng: &dyn RandomSource,
    hsid: HsId,
    descriptor: &ParsedDescriptor,
    attempt_no: u32,
) -> Result<ClientCirc, FailedAttemptError>
where
    O: CircuitOps,
    M: CircuitMap<O::CircId>,
    C: Clock,
{
    let intro_index = IntroPtIndex(attempt_no as usize);

    let (mut chosen_intro, mut intro_target) =
        ism::pick_random_intro(descriptor, hsid, ipfc, config, resolver, rng).ok_or_else(|| {
            FailedAttemptError::Bug(tor_error::internal!("no usable introduction point"))
        })?;

    let intro_fut = async {
        ops.build_intro_circuit(&intro_target)
            .await
            .map_err(|error| FailedAttemptError::IntroObtainCircuit { error, intro_index })
    };
    let rend_fut = async {
        ops.build_rendezvous_circuit()
            .await
            .map_err(|error| FailedAttemptError::RendezvousObtainCircuit { error })
    };
    let (mut intro_circ, (rend_circ, rend_target)) = futures::try_join!(intro_fut, rend_fut)?;

    let mut cookie = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut cookie);

    let rend_outcome = rsm::on_rend_circuit_opens(ops, rend_map, rend_circ.clone(), cookie).await;
    if !matches!(rend_outcome, RsmOutcome::Sent) {
        return Err(FailedAttemptError::RendezvousEstablish {
            error: CircOpError::Failed("establish_rendezvous rejected".into()),
        });
    }

    ops.await_rendezvous_established(&rend_circ)
        .await
        .map_err(|error| FailedAttemptError::RendezvousEstablish { error })?;
    let _ = rsm::on_rendezvous_established(ops, &rend_circ, CircPurpose::EstablishRend);

    // Introduce, re-extending the intro circuit to a fresh introduction
    // point on ack failure rather than rebuilding both circuits from
    // scratch; bounded the same way the outer per-request retry is.
    for _ in 0..crate::state::MAX_ATTEMPTS {
        let ism_outcome = ism::send_introduce1(
            ops,
            &intro_circ,
            &cookie,
            &rend_target,
            hsid,
            Some(descriptor),
            &chosen_intro,
            ipfc,
        )
        .await;
        if !matches!(ism_outcome, IsmOutcome::Sent) {
            return Err(FailedAttemptError::IntroObtainCircuit {
                error: CircOpError::Failed("send_introduce1 failed".into()),
                intro_index,
            });
        }

        let ack_byte = ops
            .await_introduce_ack(&intro_circ)
            .await
            .map_err(|_| FailedAttemptError::IntroductionTimeout { intro_index })?;
        let ack_status = IntroduceAckStatus::from_status_byte(ack_byte);
        let intro_auth_pk = Ed25519Identity::from(chosen_intro.ipt_sid_key());

        if ack_status == IntroduceAckStatus::Success {
            break;
        }

        let ack_outcome = ism::on_introduce_ack(
            ops,
            &intro_circ,
            &rend_circ,
            hsid,
            intro_auth_pk,
            ack_status,
            Some(descriptor),
            ipfc,
            config,
            resolver,
            rng,
        )
        .await;

        match ack_outcome {
            IsmOutcome::ReExtended {
                new_intro,
                new_target,
            } => {
                chosen_intro = new_intro;
                intro_target = new_target;
                continue;
            }
            IsmOutcome::NeedFreshIntroCircuit {
                new_intro,
                new_target,
            } => {
                chosen_intro = new_intro;
                intro_target = new_target;
                intro_circ = ops
                    .build_intro_circuit(&intro_target)
                    .await
                    .map_err(|error| FailedAttemptError::IntroObtainCircuit { error, intro_index })?;
                continue;
            }
            IsmOutcome::ClosedBothLegs => {
                return Err(FailedAttemptError::RendezvousFailed { intro_index })
            }
            // `AckSuccess` can't arrive here (handled above via the raw
            // status byte) and `Sent`/`TransientNeedRefetch`/`PermanentFailure`
            // aren't produced by `on_introduce_ack`; `UnknownAckIgnored` means
            // the status byte wasn't one of the known failure codes, which we
            // fail closed on rather than looping forever.
            _ => return Err(FailedAttemptError::RendezvousFailed { intro_index }),
        }
    }

    let service_info = crate::hs_ntor::ServiceInfo {
        auth_key: (*chosen_intro.ipt_sid_key()).into(),
        enc_key: *chosen_intro.svc_ntor_key(),
        subcredential: *descriptor.subcredential(),
    };
    let ntor = HsNtorClientState::new(&mut rand::thread_rng(), service_info);

    let rendezvous2_payload = ops
        .await_rendezvous2(&rend_circ)
        .await
        .map_err(|_| FailedAttemptError::RendezvousCompletionTimeout { intro_index })?;

    let rsm_outcome = rsm::on_rendezvous2(
        ops,
        &rend_circ,
        CircPurpose::RendReady,
        &ntor,
        &rendezvous2_payload,
    );
    match rsm_outcome {
        RsmOutcome::Joined => ops
            .take_client_circ(&rend_circ)
            .map_err(|error| FailedAttemptError::RendezvousEstablish { error }),
        RsmOutcome::AuthFailed => Err(FailedAttemptError::RendezvousAuth {
            error: crate::hs_ntor::RendezvousAuthError::BadMac,
        }),
        _ => Err(FailedAttemptError::RendezvousFailed { intro_index }),
    }
}

#[async_trait]
impl MockableConnectorData for Data {
    type ClientCirc = ClientCirc;
    type MockGlobalState = ();

    async fn connect<R: Runtime>(
        connector: &HsClientConnector<R>,
        hsid: HsId,
        data: &mut Self,
        secret_keys: HsClientSecretKeys,
    ) -> Result<Self::ClientCirc, HsClientConnError> {
        connect(connector, hsid, data, secret_keys).await
    }

    fn circuit_is_ok(circuit: &Self::ClientCirc) -> bool {
        !circuit.is_closing()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tor_linkspec::OwnedCircTarget;
    use tor_netdoc::doc::hsdesc::IntroPointDesc;

    use crate::ports::{CloseReason, RendCookie};
    use crate::relay_info::InvalidTarget;

    // Note: we don't have a way to hand-construct a real `IntroPointDesc`
    // anywhere in this workspace -- it's only ever built internally by
    // `tor-netdoc`'s own descriptor parser. That means these tests, like
    // `crate::ism`'s, can only exercise the paths that don't require
    // resolving a concrete introduction point (an empty `intro_points` list
    // is enough to reach them). The "successfully re-extends to a new,
    // concrete introduction point" path isn't exercised by a running test
    // anywhere in this crate; it's reviewed by reading `ism::close_or_reextend`
    // directly instead.

    #[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
    struct FakeCircId(u64);

    #[derive(Default)]
    struct FakeOps {
        closed: Mutex<Vec<u64>>,
    }

    #[async_trait]
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
            unreachable!("not exercised by these tests: no usable intro point is ever chosen")
        }

        async fn send_establish_rendezvous(
            &self,
            _circ: &Self::CircId,
            _cookie: &RendCookie,
        ) -> Result<(), CircOpError> {
            Ok(())
        }

        fn setup_e2e_keys(&self, _circ: &Self::CircId, _seed: &[u8]) -> Result<(), CircOpError> {
            Ok(())
        }

        async fn extend_to_new_exit(
            &self,
            _circ: &Self::CircId,
            _target: &OwnedCircTarget,
        ) -> Result<(), CircOpError> {
            unreachable!("not exercised by these tests")
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
            unreachable!("not exercised by these tests: no usable intro point is ever chosen")
        }

        async fn build_rendezvous_circuit(
            &self,
        ) -> Result<(Self::CircId, OwnedCircTarget), CircOpError> {
            unreachable!("not exercised by these tests: no usable intro point is ever chosen")
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

    #[derive(Default)]
    struct FakeMap {
        inner: Mutex<HashMap<RendCookie, FakeCircId>>,
    }
    impl CircuitMap<FakeCircId> for FakeMap {
        fn register_rend(&self, cookie: RendCookie, circ: FakeCircId) {
            self.inner.lock().unwrap().insert(cookie, circ);
        }
        fn get_rend_by_cookie(&self, cookie: &RendCookie) -> Option<FakeCircId> {
            self.inner.lock().unwrap().get(cookie).copied()
        }
        fn get_established_rend_by_cookie(&self, cookie: &RendCookie) -> Option<FakeCircId> {
            self.inner.lock().unwrap().get(cookie).copied()
        }
        fn remove(&self, cookie: &RendCookie) {
            self.inner.lock().unwrap().remove(cookie);
        }
    }

    /// A resolver that's never consulted: every test descriptor has an
    /// empty `intro_points` list, so `pick_random_intro` returns `None`
    /// before ever calling `resolve`.
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

    fn test_hsid() -> HsId {
        Ed25519Identity::from([1; 32]).into()
    }

    fn empty_descriptor() -> ParsedDescriptor {
        ParsedDescriptor {
            version: 3,
            cert_blinded_key: Ed25519Identity::from([0; 32]),
            cert_valid_until: SystemTime::now() + std::time::Duration::from_secs(3600),
            intro_points: vec![],
            subcredential: [0; 32].into(),
        }
    }

    /// I1/B3 (descriptor-vanishes variant): with no usable introduction
    /// point at all in the cached descriptor, a connection attempt must
    /// fail cleanly rather than build any circuits.
    #[test]
    fn try_once_fails_closed_with_no_usable_intro_point() {
        futures::executor::block_on(async {
            let ops = FakeOps::default();
            let rend_map = FakeMap::default();
            let ipfc = Ipfc::new(crate::clock::SystemClock);
            let config = HsClientConnectorConfig::default();
            let desc = empty_descriptor();

            let err = try_once(
                &ops,
                &rend_map,
                &ipfc,
                &config,
                &UnreachableResolver,
                &FixedRng,
                test_hsid(),
                &desc,
                0,
            )
            .await
            .unwrap_err();

            assert!(matches!(err, FailedAttemptError::Bug(_)));
        });
    }

    /// The outer per-request retry loop in `connect()` must exhaust
    /// `MAX_ATTEMPTS` distinct attempts and report them all, rather than
    /// stopping after the first failure or retrying forever.
    #[test]
    fn retry_loop_collects_one_failure_per_attempt() {
        futures::executor::block_on(async {
            let ops = FakeOps::default();
            let rend_map = FakeMap::default();
            let ipfc = Ipfc::new(crate::clock::SystemClock);
            let config = HsClientConnectorConfig::default();
            let desc = empty_descriptor();

            let mut attempts = Vec::new();
            for attempt in 0..crate::state::MAX_ATTEMPTS {
                let result = try_once(
                    &ops,
                    &rend_map,
                    &ipfc,
                    &config,
                    &UnreachableResolver,
                    &FixedRng,
                    test_hsid(),
                    &desc,
                    attempt,
                )
                .await;
                assert!(result.is_err());
                attempts.push(result);
            }
            assert_eq!(attempts.len(), crate::state::MAX_ATTEMPTS as usize);
        });
    }
}
