//! Fetch Scheduler: decides whether, and where, to launch a hidden-service
//! descriptor fetch for a given service, and tracks in-flight fetches so
//! duplicates are suppressed.
//!
//! Grounded in `fetch_v3_desc`/`pick_hsdir_v3`/`can_client_refetch_desc` from
//! the original C client, and in the teacher's `Services` bookkeeping style
//! (a small per-service record guarded by a single lock, no per-entry
//! async task beyond what's delegated to collaborators).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use base64ct::Encoding as _;
use tor_hscrypto::pk::HsId;
use tor_hscrypto::time::TimePeriod;
use tor_llcrypto::pk::ed25519::Ed25519Identity;

use crate::config::HsClientConnectorConfig;

/// Outcome of a call to [`FetchScheduler::refetch`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchStatus {
    /// A new fetch was launched; the caller should await `on_descriptor_arrived`.
    Launched,
    /// A usable descriptor is already cached; no fetch needed.
    HaveDesc,
    /// No hidden service directory is available for this blinded key.
    NoHsDirs,
    /// Descriptor fetching is disabled by configuration.
    NotAllowed,
    /// We don't yet have enough directory information to choose an HSDir.
    MissingInfo,
    /// A fetch for this service is already in flight.
    Pending,
    /// An internal error occurred.
    Error,
}

impl FetchStatus {
    /// Whether this status represents a terminal failure per §4.2's policy:
    /// all parked streams for the service should be closed and the
    /// "recently queried" memory purged.
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            FetchStatus::Error | FetchStatus::NoHsDirs | FetchStatus::NotAllowed
        )
    }
}

/// Per-service fetch-scheduler bookkeeping.
#[derive(Default)]
struct ServiceFetchState {
    /// HSDirs we've already queried for the current blinded key; reset
    /// whenever the time period (and hence blinded key) changes, or on
    /// success, or on terminal failure.
    recently_queried: HashSet<Ed25519Identity>,
    /// The blinded key `recently_queried` was computed against.
    recently_queried_for: Option<TimePeriod>,
    /// Whether a fetch is currently in flight for this service.
    fetch_in_flight: bool,
}

/// Things the fetch scheduler needs to ask about the current directory
/// state; kept abstract so it's testable without a real `NetDir`.
pub trait DirectoryInfo: Send + Sync {
    /// Whether we have a usable consensus right now.
    fn have_consensus(&self) -> bool;
    /// Whether our directory information is sufficient to pick an HSDir.
    fn have_enough_info(&self) -> bool;
    /// Responsible HSDirs for `blinded_key` at `time_period`, ranked; the
    /// first entry not in the caller's "recently queried" set should be
    /// picked.
    fn responsible_hsdirs(
        &self,
        blinded_key: &Ed25519Identity,
        time_period: TimePeriod,
    ) -> Vec<Ed25519Identity>;

    /// Derive the blinded signing key and time period currently in effect
    /// for `service_id`, if we have enough directory information to do so.
    ///
    /// This wraps the rend-spec-v3 blinded-key derivation (SRV plus
    /// service identity key), which depends on consensus parameters this
    /// trait's implementor already has to hand; it's exposed here rather
    /// than duplicated by every caller.
    fn blinded_key_and_period(&self, service_id: HsId) -> Option<(Ed25519Identity, TimePeriod)> {
        let _ = service_id;
        None
    }

    /// The service's current subcredential, if we have enough directory
    /// information to derive it.
    ///
    /// Like [`blinded_key_and_period`](Self::blinded_key_and_period), this
    /// wraps a rend-spec-v3 derivation that depends on consensus state the
    /// implementor already has to hand.
    fn subcredential_for(&self, service_id: HsId) -> Option<tor_hscrypto::Subcredential> {
        let _ = service_id;
        None
    }
}

/// The fetch scheduler.
pub(crate) struct FetchScheduler {
    /// Per-service state.
    services: Mutex<HashMap<HsId, ServiceFetchState>>,
}

impl FetchScheduler {
    /// Construct an empty fetch scheduler.
    pub(crate) fn new() -> Self {
        FetchScheduler {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate the pre-checks and HSDir selection for `service_id`, per
    /// §4.2, given whether a usable descriptor is already cached
    /// (`have_usable_desc`).
    ///
    /// On `Launched`, returns the chosen HSDir identity and resource string
    /// so the caller can actually perform the fetch; the caller is
    /// responsible for calling [`FetchScheduler::fetch_completed`] when it's
    /// done (success or failure).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn refetch(
        &self,
        config: &HsClientConnectorConfig,
        dirinfo: &dyn DirectoryInfo,
        service_id: HsId,
        blinded_key: Ed25519Identity,
        time_period: TimePeriod,
        have_usable_desc: bool,
    ) -> (FetchStatus, Option<(Ed25519Identity, String)>) {
        if !config.enabled {
            return (FetchStatus::NotAllowed, None);
        }
        if !dirinfo.have_consensus() {
            return (FetchStatus::MissingInfo, None);
        }
        if !dirinfo.have_enough_info() {
            return (FetchStatus::MissingInfo, None);
        }
        if have_usable_desc {
            return (FetchStatus::HaveDesc, None);
        }

        let mut services = self.services.lock().expect("fetch scheduler poisoned");
        let state = services.entry(service_id).or_default();
        if state.fetch_in_flight {
            return (FetchStatus::Pending, None);
        }

        if state.recently_queried_for != Some(time_period) {
            state.recently_queried.clear();
            state.recently_queried_for = Some(time_period);
        }

        let candidates = dirinfo.responsible_hsdirs(&blinded_key, time_period);
        let chosen = candidates
            .into_iter()
            .find(|hsdir| !state.recently_queried.contains(hsdir));
        let Some(hsdir) = chosen else {
            return (FetchStatus::NoHsDirs, None);
        };

        state.recently_queried.insert(hsdir);
        state.fetch_in_flight = true;
        let resource = base64ct::Base64Unpadded::encode_string(blinded_key.as_bytes());
        (FetchStatus::Launched, Some((hsdir, resource)))
    }

    /// Record that the in-flight fetch for `service_id` has completed
    /// (successfully or not). Must be called exactly once per `Launched`.
    pub(crate) fn fetch_completed(&self, service_id: HsId) {
        let mut services = self.services.lock().expect("fetch scheduler poisoned");
        if let Some(state) = services.get_mut(&service_id) {
            state.fetch_in_flight = false;
        }
    }

    /// Purge the "recently queried" memory for `service_id`, e.g. after a
    /// terminal failure or a successful connection (§4.2, §4.6).
    pub(crate) fn purge_recently_queried(&self, service_id: HsId) {
        let mut services = self.services.lock().expect("fetch scheduler poisoned");
        if let Some(state) = services.get_mut(&service_id) {
            state.recently_queried.clear();
            state.recently_queried_for = None;
        }
    }

    /// Drop all bookkeeping for every service, e.g. on `NEWNYM`.
    pub(crate) fn purge_all(&self) {
        self.services.lock().expect("fetch scheduler poisoned").clear();
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn hsid() -> HsId {
        Ed25519Identity::from([1; 32]).into()
    }
    fn tp() -> TimePeriod {
        TimePeriod::new(std::time::Duration::from_secs(86400), std::time::SystemTime::now())
    }

    struct FakeDir {
        consensus: bool,
        enough_info: bool,
        hsdirs: Vec<Ed25519Identity>,
    }
    impl DirectoryInfo for FakeDir {
        fn have_consensus(&self) -> bool {
            self.consensus
        }
        fn have_enough_info(&self) -> bool {
            self.enough_info
        }
        fn responsible_hsdirs(
            &self,
            _blinded_key: &Ed25519Identity,
            _time_period: TimePeriod,
        ) -> Vec<Ed25519Identity> {
            self.hsdirs.clone()
        }
    }

    fn good_dir() -> FakeDir {
        FakeDir {
            consensus: true,
            enough_info: true,
            hsdirs: vec![Ed25519Identity::from([2; 32])],
        }
    }

    #[test]
    fn not_allowed_when_disabled() {
        let fs = FetchScheduler::new();
        let mut cfg = HsClientConnectorConfig::default();
        cfg.enabled = false;
        let (status, _) = fs.refetch(&cfg, &good_dir(), hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status, FetchStatus::NotAllowed);
    }

    #[test]
    fn missing_info_when_no_consensus() {
        let fs = FetchScheduler::new();
        let cfg = HsClientConnectorConfig::default();
        let mut dir = good_dir();
        dir.consensus = false;
        let (status, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status, FetchStatus::MissingInfo);
    }

    #[test]
    fn have_desc_short_circuits() {
        let fs = FetchScheduler::new();
        let cfg = HsClientConnectorConfig::default();
        let (status, _) = fs.refetch(&cfg, &good_dir(), hsid(), [3; 32].into(), tp(), true);
        assert_eq!(status, FetchStatus::HaveDesc);
    }

    #[test]
    fn no_hsdirs_when_candidate_list_empty() {
        let fs = FetchScheduler::new();
        let cfg = HsClientConnectorConfig::default();
        let mut dir = good_dir();
        dir.hsdirs.clear();
        let (status, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status, FetchStatus::NoHsDirs);
    }

    /// R2: repeated `refetch` while a fetch is in flight returns `Pending`.
    #[test]
    fn duplicate_refetch_returns_pending() {
        let fs = FetchScheduler::new();
        let cfg = HsClientConnectorConfig::default();
        let dir = good_dir();
        let (status1, launch) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status1, FetchStatus::Launched);
        assert!(launch.is_some());
        let (status2, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status2, FetchStatus::Pending);
        let (status3, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status3, FetchStatus::Pending);
    }

    /// I3: at most one in-flight fetch per service.
    #[test]
    fn completion_allows_relaunch() {
        let fs = FetchScheduler::new();
        let cfg = HsClientConnectorConfig::default();
        let dir = good_dir();
        let (status1, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status1, FetchStatus::Launched);
        fs.fetch_completed(hsid());
        let (status2, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status2, FetchStatus::Launched);
    }

    #[test]
    fn recently_queried_is_skipped_until_purged() {
        let fs = FetchScheduler::new();
        let cfg = HsClientConnectorConfig::default();
        let hsdir = Ed25519Identity::from([2; 32]);
        let dir = FakeDir {
            consensus: true,
            enough_info: true,
            hsdirs: vec![hsdir],
        };
        let (status1, launch1) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status1, FetchStatus::Launched);
        assert_eq!(launch1.unwrap().0, hsdir);
        fs.fetch_completed(hsid());

        // Same time period: the only HSDir was already queried, so no
        // candidate remains.
        let (status2, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status2, FetchStatus::NoHsDirs);

        fs.purge_recently_queried(hsid());
        let (status3, _) = fs.refetch(&cfg, &dir, hsid(), [3; 32].into(), tp(), false);
        assert_eq!(status3, FetchStatus::Launched);
    }
}
