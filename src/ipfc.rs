//! Intro-Point Failure Cache: per-`(service, intro point)` memory of recent
//! failures, used to steer future introduction-point selection away from
//! points that are currently misbehaving.
//!
//! Grounded on the teacher's `state.rs` bookkeeping style (an
//! [`Instant`]-keyed entry with a `last_used`/expiry field) and on
//! `intro_point_is_usable`/`hs_cache_client_intro_state_note` in the
//! original C client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tor_hscrypto::pk::HsId;
use tor_llcrypto::pk::ed25519::Ed25519Identity;

use crate::clock::Clock;

/// Number of reachability failures after which an introduction point is
/// considered unusable, independent of any other failure kind.
pub(crate) const MAX_REACH_FAILURES: u32 = 3;

/// How long an [`IntroState`] entry survives without being refreshed.
///
/// Chosen so that a stuck introduction point naturally recovers within a
/// couple of minutes, matching the design target.
pub(crate) const INTRO_STATE_TTL: Duration = Duration::from_secs(2 * 60);

/// The kind of failure being recorded against an introduction point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// A generic `INTRODUCE_ACK` failure (bad format, no relay, etc).
    Generic,
    /// The introduction attempt timed out.
    Timeout,
    /// The introduction point itself could not be reached (e.g. circuit
    /// extension failed).
    Unreachable,
}

/// Recorded failure history for one `(service_id, intro_auth_key)` pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IntroState {
    /// A generic failure was recorded (sticky: never cleared except by
    /// expiry or purge).
    pub error: bool,
    /// An introduction attempt against this point timed out.
    pub timed_out: bool,
    /// Number of times this point has been found unreachable.
    pub unreachable_count: u32,
}

impl IntroState {
    /// Whether an introduction point with this history is currently usable.
    pub fn is_usable(&self) -> bool {
        !self.error && !self.timed_out && self.unreachable_count < MAX_REACH_FAILURES
    }
}

/// Key identifying one introduction point's failure-history entry.
type Key = (HsId, Ed25519Identity);

/// Entry stored internally, carrying the bookkeeping needed for TTL expiry.
#[derive(Clone, Copy, Debug)]
struct Entry {
    /// The accumulated failure state.
    state: IntroState,
    /// When this entry was last touched; used for TTL expiry.
    last_touched: Instant,
}

/// The intro-point failure cache.
///
/// Generic over the clock so tests can advance time deterministically; see
/// [`crate::clock`].
pub(crate) struct Ipfc<C: Clock> {
    /// Clock used for TTL bookkeeping.
    clock: C,
    /// Failure-history entries, keyed by service and intro-point auth key.
    entries: Mutex<HashMap<Key, Entry>>,
}

impl<C: Clock> Ipfc<C> {
    /// Construct an empty cache using `clock` for TTL bookkeeping.
    pub(crate) fn new(clock: C) -> Self {
        Ipfc {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of kind `kind` against `(service_id, intro_auth_pk)`.
    pub(crate) fn note(&self, service_id: HsId, intro_auth_pk: Ed25519Identity, kind: FailureKind) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("ipfc poisoned");
        let entry = entries
            .entry((service_id, intro_auth_pk))
            .or_insert_with(|| Entry {
                state: IntroState::default(),
                last_touched: now,
            });
        entry.last_touched = now;
        match kind {
            FailureKind::Generic => entry.state.error = true,
            FailureKind::Timeout => entry.state.timed_out = true,
            FailureKind::Unreachable => entry.state.unreachable_count += 1,
        }
    }

    /// Look up the current failure state for `(service_id, intro_auth_pk)`,
    /// expiring it first if its TTL has elapsed.
    pub(crate) fn find(
        &self,
        service_id: HsId,
        intro_auth_pk: Ed25519Identity,
    ) -> Option<IntroState> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("ipfc poisoned");
        let key = (service_id, intro_auth_pk);
        match entries.get(&key) {
            Some(entry) if now.saturating_duration_since(entry.last_touched) < INTRO_STATE_TTL => {
                Some(entry.state)
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// The usability predicate from the design's data model: an intro point
    /// is usable unless we have a live (non-expired) entry saying it isn't.
    pub(crate) fn is_usable(&self, service_id: HsId, intro_auth_pk: Ed25519Identity) -> bool {
        self.find(service_id, intro_auth_pk)
            .map(|s| s.is_usable())
            .unwrap_or(true)
    }

    /// Drop all recorded failure history, e.g. on `NEWNYM`.
    pub(crate) fn purge_all(&self) {
        self.entries.lock().expect("ipfc poisoned").clear();
    }
}
