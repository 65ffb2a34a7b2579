//! Trait-based interfaces ("ports") to collaborators that this crate treats
//! as external: the circuit builder, the directory-fetch transport, the
//! rendezvous-cookie circuit map, and the descriptor parser.
//!
//! Mirrors the dependency-inversion pattern the teacher crate uses for
//! `MockableConnectorData`: production code implements these traits against
//! the real `tor-circmgr`/`tor-proto`/`tor-dirclient`/`tor-netdoc` crates;
//! tests implement them against small in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;

use tor_hscrypto::pk::HsId;
use tor_hscrypto::time::TimePeriod;
use tor_hscrypto::Subcredential;
use tor_linkspec::OwnedCircTarget;
use tor_llcrypto::pk::ed25519;
use tor_netdoc::doc::hsdesc::IntroPointDesc;
use tor_proto::circuit::ClientCirc;

use crate::relay_info::InvalidTarget;

/// Resolves an advertised introduction point into a `CircTarget` usable for
/// circuit extension.
///
/// Abstracts over `tor_netdir::NetDir` so that introduction-point selection
/// (`crate::ism::pick_random_intro`) can be exercised against a fake
/// directory in tests, the same way [`CircuitOps`] abstracts over the real
/// circuit builder.
pub trait IntroPointResolver: Send + Sync {
    /// Resolve `desc` into a target, filling in missing relay information
    /// and cross-checking identities against whatever directory state this
    /// resolver is backed by.
    fn resolve(&self, desc: &IntroPointDesc) -> Result<OwnedCircTarget, InvalidTarget>;
}

impl IntroPointResolver for tor_netdir::NetDir {
    fn resolve(&self, desc: &IntroPointDesc) -> Result<OwnedCircTarget, InvalidTarget> {
        let target = crate::relay_info::ipt_to_circtarget(desc, self)?;
        Ok(OwnedCircTarget::from_circ_target(&target))
    }
}

/// A rendezvous cookie: 20 bytes chosen by the client, carried in
/// `ESTABLISH_RENDEZVOUS` and echoed back (indirectly) in `RENDEZVOUS2`.
pub type RendCookie = [u8; 20];

/// Reason given when asking a collaborator to close a circuit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// The circuit finished its job normally.
    Finished,
    /// A protocol violation was observed on this circuit.
    ProtocolViolation,
    /// An internal invariant was violated; this should not normally happen.
    Internal,
}

/// The purpose currently assigned to a circuit, as tracked by the circuit
/// layer on our behalf.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircPurpose {
    /// Extending towards / waiting to send `INTRODUCE1` on an intro circuit.
    Introducing,
    /// Waiting for `INTRODUCE_ACK` on an intro circuit.
    AckWait,
    /// `INTRODUCE_ACK` succeeded; the intro circuit is being torn down.
    Acked,
    /// Waiting for `RENDEZVOUS_ESTABLISHED` on a rendezvous circuit.
    EstablishRend,
    /// Rendezvous point is up, waiting for `INTRODUCE_ACK`/`RENDEZVOUS2`.
    RendReady,
    /// `INTRODUCE_ACK` arrived first; still waiting for `RENDEZVOUS2`.
    ReadyIntroAcked,
    /// `RENDEZVOUS2` verified; end-to-end keys installed.
    RendJoined,
}

/// Operations this core needs to perform on a circuit, regardless of which
/// concrete circuit-builder crate backs it.
///
/// Grounded in the outbound operations named for the "Circuit layer" in the
/// external-interfaces section of the design, and in the way the teacher's
/// `connect.rs` sketches using `tor_proto::circuit::ClientCirc`.
#[async_trait]
pub trait CircuitOps: Send + Sync {
    /// Opaque identity for a circuit, stable for its lifetime.
    type CircId: Clone + Eq + std::hash::Hash + Send + Sync + std::fmt::Debug;

    /// Send an `INTRODUCE1` cell on `intro_circ`, addressed to the given
    /// introduction point, carrying the rendezvous circuit's extend info
    /// and cookie, under `subcredential`.
    async fn send_introduce1(
        &self,
        intro_circ: &Self::CircId,
        rend_cookie: &RendCookie,
        rend_target: &OwnedCircTarget,
        intro_point: &IntroPointDesc,
        subcredential: &Subcredential,
    ) -> Result<(), CircOpError>;

    /// Send `ESTABLISH_RENDEZVOUS` carrying `cookie` on `circ`.
    async fn send_establish_rendezvous(
        &self,
        circ: &Self::CircId,
        cookie: &RendCookie,
    ) -> Result<(), CircOpError>;

    /// Install end-to-end keys derived from the rendezvous handshake onto
    /// `circ`'s final (virtual) hop.
    fn setup_e2e_keys(&self, circ: &Self::CircId, ntor_key_seed: &[u8]) -> Result<(), CircOpError>;

    /// Extend `circ` to a new final hop, used to re-extend an introduction
    /// circuit to a different introduction point.
    async fn extend_to_new_exit(
        &self,
        circ: &Self::CircId,
        target: &OwnedCircTarget,
    ) -> Result<(), CircOpError>;

    /// Change the purpose recorded for `circ`.
    fn change_purpose(&self, circ: &Self::CircId, purpose: CircPurpose);

    /// Mark `circ` for close, with the given reason.
    fn mark_for_close(&self, circ: &Self::CircId, reason: CloseReason);

    /// Record a path-bias "use attempt" on `circ`.
    fn pathbias_count_use_attempt(&self, circ: &Self::CircId);

    /// Record a path-bias "use success" on `circ`.
    fn pathbias_count_use_success(&self, circ: &Self::CircId);

    /// Number of RELAY_EARLY cells this circuit still has budget to send;
    /// used to decide whether an intro circuit can be re-extended in place.
    fn remaining_relay_early_cells(&self, circ: &Self::CircId) -> u32;

    /// Build and extend a fresh circuit to `target`, for use as an
    /// introduction circuit.
    async fn build_intro_circuit(
        &self,
        target: &OwnedCircTarget,
    ) -> Result<Self::CircId, CircOpError>;

    /// Build a fresh circuit to a rendezvous point of the collaborator's
    /// choosing, for use as a rendezvous circuit.
    ///
    /// Returns the circuit along with the target the collaborator chose, so
    /// that the caller can embed it in the `INTRODUCE1` cell it sends to the
    /// introduction point.
    async fn build_rendezvous_circuit(
        &self,
    ) -> Result<(Self::CircId, OwnedCircTarget), CircOpError>;

    /// Wait for the `RENDEZVOUS_ESTABLISHED` reply on `circ`.
    async fn await_rendezvous_established(&self, circ: &Self::CircId) -> Result<(), CircOpError>;

    /// Wait for the `INTRODUCE_ACK` status byte on `intro_circ`.
    async fn await_introduce_ack(&self, intro_circ: &Self::CircId) -> Result<u8, CircOpError>;

    /// Wait for the `RENDEZVOUS2` payload on `rend_circ`.
    async fn await_rendezvous2(&self, rend_circ: &Self::CircId) -> Result<Vec<u8>, CircOpError>;

    /// Resolve `circ` to the real, owned circuit handle it identifies.
    ///
    /// Called once a rendezvous circuit has joined, so that the joined
    /// circuit can be handed back to the application as the result of a
    /// connection attempt; `Self::CircId` is otherwise treated as wholly
    /// opaque by this core.
    fn take_client_circ(&self, circ: &Self::CircId) -> Result<ClientCirc, CircOpError>;
}

/// Error from a [`CircuitOps`] operation.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CircOpError {
    /// The circuit-layer collaborator reported a transport/protocol error.
    #[error("circuit operation failed: {0}")]
    Failed(String),
    /// The circuit was already closed when we tried to use it.
    #[error("circuit already closed")]
    Closed,
}

/// Map from rendezvous cookie to the rendezvous circuit using it.
///
/// Grounded in the design's requirement that intro and rendezvous circuits
/// only ever correlate with one another by re-looking up this map by
/// cookie, never by holding direct references to each other.
pub trait CircuitMap<C>: Send + Sync {
    /// Register `circ` under `cookie`. Replaces any previous entry.
    fn register_rend(&self, cookie: RendCookie, circ: C);

    /// Look up the rendezvous circuit for `cookie`, regardless of its RSM
    /// state.
    fn get_rend_by_cookie(&self, cookie: &RendCookie) -> Option<C>;

    /// Look up the rendezvous circuit for `cookie`, only if it has already
    /// reached `rend_ready` or later.
    fn get_established_rend_by_cookie(&self, cookie: &RendCookie) -> Option<C>;

    /// Remove any entry for `cookie`.
    fn remove(&self, cookie: &RendCookie);
}

/// An identifier attached to an in-flight directory request, so that the
/// completion callback knows which service it belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DirIdent {
    /// The service this fetch is for.
    pub service_id: HsId,
    /// The blinded key used to construct the request, and under which the
    /// resulting descriptor should be validated.
    pub blinded_key: ed25519::Ed25519Identity,
    /// The time period the blinded key was derived for.
    pub time_period: TimePeriod,
}

/// Launches anonymous directory fetches on our behalf.
///
/// Grounded in the `launch_anonymous_dir_fetch` outbound operation; modeled
/// in production terms by `tor_dirclient`/`tor_circmgr`.
#[async_trait]
pub trait DirectoryOps: Send + Sync {
    /// Launch an anonymized directory request for resource (base64 of the
    /// blinded key), tagging the eventual response with `ident` so the
    /// driver can route the arrival callback.
    async fn launch_anonymous_dir_fetch(
        &self,
        resource: String,
        ident: DirIdent,
    ) -> Result<Vec<u8>, DirOpError>;
}

/// Error from a [`DirectoryOps`] operation.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DirOpError {
    /// No usable HSDir circuit could be built.
    #[error("could not reach hidden service directory: {0}")]
    Circuit(String),
    /// The directory request itself failed (bad status, timeout, etc).
    #[error("directory request failed: {0}")]
    Request(String),
}

/// Parses raw descriptor bytes into a validated descriptor, given the
/// subcredential the caller has already derived.
///
/// This core never second-guesses the parser's cryptographic work; it only
/// checks the version and the cross-certificate as described in the
/// component design for the descriptor cache.
pub trait DescriptorParser: Send + Sync {
    /// Parsed descriptor type.
    type Descriptor: Clone + Send + Sync;

    /// Parse and (partially) validate `bytes` using `subcredential`.
    fn decode(
        &self,
        bytes: &[u8],
        subcredential: &Subcredential,
    ) -> Result<Self::Descriptor, InvalidTarget>;
}

/// A source of randomness, abstracted so intro-point selection is testable
/// without requiring a real CSPRNG in unit tests.
pub trait RandomSource: Send + Sync {
    /// Return a uniformly-distributed integer in `0..bound`.
    ///
    /// `bound` must be nonzero.
    fn crypto_rand_below(&self, bound: usize) -> usize;
}

/// The default, OS-backed random source.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandomSource;

impl RandomSource for OsRandomSource {
    fn crypto_rand_below(&self, bound: usize) -> usize {
        use rand::Rng as _;
        rand::thread_rng().gen_range(0..bound)
    }
}

/// A clonable, shared [`CircuitOps`] handle, as stored by [`crate::state`].
pub type SharedCircuitOps<C> = Arc<dyn CircuitOps<CircId = C>>;
