//! Descriptor Cache (client view) and stream reconciliation: the glue that
//! turns a fetched descriptor into unparked application streams.
//!
//! Grounded in `desc_cache.c`'s `cache_get`/`cache_store` pair for the DCV
//! half, and in `hs_client.c`'s `connection_ap_expects_a_hidden_service`
//! reattachment loop and `hs_client_resolve_descriptor` for the stream half.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use tor_hscrypto::pk::HsId;
use tor_llcrypto::pk::ed25519::Ed25519Identity;

use crate::fetch::FetchStatus;
use crate::ism::DescriptorView;

/// A descriptor as produced by the parser, extended with the two checks DCV
/// performs itself rather than trusting the parser for (§4.1): the
/// version tag, and the signing-key cross-certificate.
///
/// Grounded in the design's explicit statement that the core "never decodes
/// descriptors itself" but does perform these two checks after decode.
pub trait CheckedDescriptor: DescriptorView {
    /// The descriptor format version; must be 3.
    fn version(&self) -> u8;

    /// Whether the descriptor's signing-key certificate verifies under
    /// `blinded_key` as of `now`.
    fn signing_cert_valid(&self, blinded_key: &Ed25519Identity, now: SystemTime) -> bool;
}

/// A rejected descriptor: recorded as a logged warning, never stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum DescriptorRejected {
    /// The descriptor's `version` field was not 3.
    #[error("unsupported descriptor version")]
    WrongVersion,
    /// The signing-key certificate did not verify under the current
    /// blinded key.
    #[error("descriptor signing certificate did not verify")]
    BadSigningCert,
}

/// Lookup-only surface over the descriptor store, per §4.1.
///
/// Generic over the validated descriptor type so it composes with whatever
/// [`crate::ports::DescriptorParser`] implementation is in use.
pub(crate) struct Dcv<D> {
    by_service: Mutex<HashMap<HsId, D>>,
}

impl<D: CheckedDescriptor + Clone> Dcv<D> {
    /// Construct an empty descriptor cache.
    pub(crate) fn new() -> Self {
        Dcv {
            by_service: Mutex::new(HashMap::new()),
        }
    }

    /// Return the currently cached, validated descriptor for `service_id`,
    /// if any.
    pub(crate) fn lookup(&self, service_id: HsId) -> Option<D> {
        self.by_service
            .lock()
            .expect("dcv poisoned")
            .get(&service_id)
            .cloned()
    }

    /// Validate and store a freshly parsed descriptor for `service_id`,
    /// replacing any previous entry. Rejects without mutating the cache on
    /// failure.
    pub(crate) fn store(
        &self,
        service_id: HsId,
        blinded_key: Ed25519Identity,
        now: SystemTime,
        descriptor: D,
    ) -> Result<(), DescriptorRejected> {
        if descriptor.version() != 3 {
            return Err(DescriptorRejected::WrongVersion);
        }
        if !descriptor.signing_cert_valid(&blinded_key, now) {
            return Err(DescriptorRejected::BadSigningCert);
        }
        self.by_service
            .lock()
            .expect("dcv poisoned")
            .insert(service_id, descriptor);
        Ok(())
    }

    /// Drop every cached descriptor, e.g. on `NEWNYM`.
    pub(crate) fn purge_all(&self) {
        self.by_service.lock().expect("dcv poisoned").clear();
    }
}

/// Where one application stream currently stands, per §4.6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// Waiting for a usable descriptor to arrive.
    RenddescWait,
    /// Descriptor present; waiting for intro/rendezvous circuits to join.
    CircuitWait,
    /// Attached to a joined rendezvous circuit.
    Attached,
    /// Closed; resolution failed.
    Closed,
}

/// A parked application stream, as tracked by the reconciliation logic.
#[derive(Clone, Debug)]
pub struct PendingStream {
    /// The service this stream wants to reach.
    pub service_id: HsId,
    /// Current state.
    pub state: StreamState,
}

/// Result of reconciling streams against a newly arrived descriptor.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ReconcileOutcome {
    /// Indices (into the caller's stream table) that were transitioned to
    /// `circuit_wait` and should be (re-)registered as pending.
    pub woken: Vec<usize>,
    /// Indices that were closed because the new descriptor has no usable
    /// intro point.
    pub closed: Vec<usize>,
}

/// Handle descriptor arrival for `service_id`, per §4.6's "On descriptor
/// arrival" rule: every matching `renddesc_wait` stream either advances to
/// `circuit_wait` or is closed, depending on whether the new descriptor has
/// at least one usable intro point.
pub(crate) fn on_descriptor_arrival(
    streams: &mut [PendingStream],
    service_id: HsId,
    has_usable_intro_point: bool,
    now: SystemTime,
) -> ReconcileOutcome {
    let _ = now; // freshness timestamps are tracked by the caller's stream table
    let mut outcome = ReconcileOutcome::default();
    for (idx, stream) in streams.iter_mut().enumerate() {
        if stream.service_id != service_id || stream.state != StreamState::RenddescWait {
            continue;
        }
        if has_usable_intro_point {
            stream.state = StreamState::CircuitWait;
            outcome.woken.push(idx);
        } else {
            stream.state = StreamState::Closed;
            outcome.closed.push(idx);
        }
    }
    outcome
}

/// Housekeeping to run after a stream successfully attaches to a service,
/// per §4.6's "On successful connection" rule: forget which HSDirs were
/// recently queried (so a later fetch may reuse them), but leave IPFC
/// untouched.
pub(crate) fn on_connection_attempt_succeeded(
    fetch: &crate::fetch::FetchScheduler,
    service_id: HsId,
) {
    fetch.purge_recently_queried(service_id);
}

/// Outcome of retrying every parked stream on a directory-info change.
#[derive(Debug, Default)]
pub struct DirInfoRetryOutcome {
    /// Number of streams for which `refetch` was invoked.
    pub retried: usize,
    /// Number of times the defensively-handled "impossible" `HaveDesc`
    /// sentinel was observed (§4.6: would indicate a descriptor arrived
    /// without waking its streams, an invariant violation worth logging).
    pub impossible_have_desc: usize,
}

/// Retry every `renddesc_wait` stream's descriptor fetch on a directory
/// info change, per §4.6's "On directory info change" rule.
#[allow(clippy::too_many_arguments)]
pub(crate) fn on_dir_info_changed(
    streams: &[PendingStream],
    fetch: &crate::fetch::FetchScheduler,
    config: &crate::config::HsClientConnectorConfig,
    dirinfo: &dyn crate::fetch::DirectoryInfo,
    service_lookup: impl Fn(HsId) -> Option<(Ed25519Identity, tor_hscrypto::time::TimePeriod, bool)>,
) -> DirInfoRetryOutcome {
    let mut outcome = DirInfoRetryOutcome::default();
    let mut seen = std::collections::HashSet::new();
    for stream in streams {
        if stream.state != StreamState::RenddescWait || !seen.insert(stream.service_id.clone()) {
            continue;
        }
        // A service that's vanished from our records entirely (e.g. its
        // secret keys were forgotten between the stream parking and this
        // retry) has nothing to refetch.
        let Some((blinded_key, time_period, have_usable_desc)) =
            service_lookup(stream.service_id.clone())
        else {
            continue;
        };
        let (status, _launch) = fetch.refetch(
            config,
            dirinfo,
            stream.service_id.clone(),
            blinded_key,
            time_period,
            have_usable_desc,
        );
        outcome.retried += 1;
        if status == FetchStatus::HaveDesc {
            // This should be impossible: arrival of a usable descriptor
            // would already have woken this stream out of renddesc_wait.
            outcome.impossible_have_desc += 1;
            tracing::warn!(
                service_id = ?stream.service_id,
                "refetch() reported HaveDesc for a stream still waiting on a descriptor"
            );
        }
    }
    outcome
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tor_hscrypto::Subcredential;
    use tor_netdoc::doc::hsdesc::IntroPointDesc;

    fn hsid(b: u8) -> HsId {
        Ed25519Identity::from([b; 32]).into()
    }

    #[test]
    fn descriptor_arrival_wakes_matching_streams_with_usable_intro_points() {
        let mut streams = vec![
            PendingStream {
                service_id: hsid(1),
                state: StreamState::RenddescWait,
            },
            PendingStream {
                service_id: hsid(2),
                state: StreamState::RenddescWait,
            },
            PendingStream {
                service_id: hsid(1),
                state: StreamState::CircuitWait,
            },
        ];
        let outcome = on_descriptor_arrival(&mut streams, hsid(1), true, SystemTime::now());
        assert_eq!(outcome.woken, vec![0]);
        assert!(outcome.closed.is_empty());
        assert_eq!(streams[0].state, StreamState::CircuitWait);
        assert_eq!(streams[1].state, StreamState::RenddescWait);
    }

    #[test]
    fn descriptor_arrival_closes_streams_when_no_usable_intro_points() {
        let mut streams = vec![PendingStream {
            service_id: hsid(3),
            state: StreamState::RenddescWait,
        }];
        let outcome = on_descriptor_arrival(&mut streams, hsid(3), false, SystemTime::now());
        assert_eq!(outcome.closed, vec![0]);
        assert!(outcome.woken.is_empty());
        assert_eq!(streams[0].state, StreamState::Closed);
    }

    #[derive(Clone)]
    struct FakeDesc {
        version: u8,
        valid_cert: bool,
        intros: Vec<IntroPointDesc>,
        subcred: Subcredential,
    }
    impl DescriptorView for FakeDesc {
        fn intro_points(&self) -> &[IntroPointDesc] {
            &self.intros
        }
        fn subcredential(&self) -> &Subcredential {
            &self.subcred
        }
    }
    impl CheckedDescriptor for FakeDesc {
        fn version(&self) -> u8 {
            self.version
        }
        fn signing_cert_valid(&self, _blinded_key: &Ed25519Identity, _now: SystemTime) -> bool {
            self.valid_cert
        }
    }

    #[test]
    fn dcv_rejects_wrong_version() {
        let dcv = Dcv::new();
        let desc = FakeDesc {
            version: 2,
            valid_cert: true,
            intros: vec![],
            subcred: [1; 32].into(),
        };
        let err = dcv
            .store(hsid(4), [0; 32].into(), SystemTime::now(), desc)
            .unwrap_err();
        assert_eq!(err, DescriptorRejected::WrongVersion);
        assert!(dcv.lookup(hsid(4)).is_none());
    }

    #[test]
    fn dcv_rejects_bad_signing_cert() {
        let dcv = Dcv::new();
        let desc = FakeDesc {
            version: 3,
            valid_cert: false,
            intros: vec![],
            subcred: [1; 32].into(),
        };
        let err = dcv
            .store(hsid(5), [0; 32].into(), SystemTime::now(), desc)
            .unwrap_err();
        assert_eq!(err, DescriptorRejected::BadSigningCert);
        assert!(dcv.lookup(hsid(5)).is_none());
    }

    struct FakeDir {
        hsdirs: Vec<Ed25519Identity>,
    }
    impl crate::fetch::DirectoryInfo for FakeDir {
        fn have_consensus(&self) -> bool {
            true
        }
        fn have_enough_info(&self) -> bool {
            true
        }
        fn responsible_hsdirs(
            &self,
            _blinded_key: &Ed25519Identity,
            _time_period: tor_hscrypto::time::TimePeriod,
        ) -> Vec<Ed25519Identity> {
            self.hsdirs.clone()
        }
    }

    fn tp() -> tor_hscrypto::time::TimePeriod {
        tor_hscrypto::time::TimePeriod::new(
            std::time::Duration::from_secs(86400),
            SystemTime::now(),
        )
    }

    #[test]
    fn dir_info_changed_retries_only_renddesc_wait_streams_once_each() {
        let fetch = crate::fetch::FetchScheduler::new();
        let config = crate::config::HsClientConnectorConfig::default();
        let dir = FakeDir {
            hsdirs: vec![Ed25519Identity::from([9; 32])],
        };
        let streams = vec![
            PendingStream {
                service_id: hsid(10),
                state: StreamState::RenddescWait,
            },
            PendingStream {
                service_id: hsid(10),
                state: StreamState::RenddescWait,
            },
            PendingStream {
                service_id: hsid(11),
                state: StreamState::Attached,
            },
        ];
        let outcome = on_dir_info_changed(&streams, &fetch, &config, &dir, |service_id| {
            Some((Ed25519Identity::from([0; 32]), tp(), false))
                .filter(|_| service_id == hsid(10))
        });
        assert_eq!(outcome.retried, 1);
        assert_eq!(outcome.impossible_have_desc, 0);
    }

    #[test]
    fn dir_info_changed_skips_services_the_lookup_no_longer_knows() {
        let fetch = crate::fetch::FetchScheduler::new();
        let config = crate::config::HsClientConnectorConfig::default();
        let dir = FakeDir {
            hsdirs: vec![Ed25519Identity::from([9; 32])],
        };
        let streams = vec![PendingStream {
            service_id: hsid(12),
            state: StreamState::RenddescWait,
        }];
        let outcome = on_dir_info_changed(&streams, &fetch, &config, &dir, |_| None);
        assert_eq!(outcome.retried, 0);
    }

    #[test]
    fn dcv_stores_and_looks_up_valid_descriptor() {
        let dcv = Dcv::new();
        let desc = FakeDesc {
            version: 3,
            valid_cert: true,
            intros: vec![],
            subcred: [7; 32].into(),
        };
        dcv.store(hsid(6), [0; 32].into(), SystemTime::now(), desc)
            .unwrap();
        assert!(dcv.lookup(hsid(6)).is_some());
        dcv.purge_all();
        assert!(dcv.lookup(hsid(6)).is_none());
    }
}
