#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![cfg_attr(not(ci_arti_stable), allow(renamed_and_removed_lints))]
#![cfg_attr(not(ci_arti_nightly), allow(unknown_lints))]
#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod clock;
mod config;
mod connect;
mod err;
mod fetch;
mod hs_ntor;
mod ipfc;
mod ism;
mod isol_map;
mod keys;
mod ports;
mod relay_info;
mod rsm;
mod state;
mod streams;

use std::future::Future;
use std::sync::{Arc, Mutex};

use educe::Educe;

use tor_circmgr::isolation::Isolation;
use tor_circmgr::CircMgr;
use tor_hscrypto::pk::HsId;
use tor_netdir::NetDirProvider;
use tor_proto::circuit::ClientCirc;
use tor_rtcompat::Runtime;

pub use config::{ExcludeNodes, HsClientConnectorConfig};
pub use err::{HsClientConnError, StartupError};
pub use keys::{HsClientSecretKeys, HsClientSecretKeysBuilder};

use state::Services;

/// An object that negotiates connections with onion services
///
/// This can be used by multiple requests on behalf of different clients,
/// with potentially different HS client authentication (`KS_hsc_*`)
/// and potentially different circuit isolation.
///
/// The principal entrypoint is
/// [`get_or_launch_connection()`](HsClientConnector::get_or_launch_connection).
#[derive(Educe)]
#[educe(Clone)]
pub struct HsClientConnector<R: Runtime, D: state::MockableConnectorData = connect::Data> {
    /// The runtime
    runtime: R,
    /// A [`CircMgr`] that we use to build circuits to HsDirs, introduction
    /// points, and rendezvous points.
    circmgr: Arc<CircMgr<R>>,
    /// A [`NetDirProvider`] that we use to pick rendezvous points.
    netdir_provider: Arc<dyn NetDirProvider>,
    /// Information we are remembering about different onion services.
    services: Arc<Mutex<state::Services<D>>>,
    /// For mocking in tests of `state.rs`
    mock_for_state: D::MockGlobalState,

    /// The descriptor cache (client view): validated descriptors we've
    /// already fetched, keyed by service.
    dcv: Arc<streams::Dcv<connect::ParsedDescriptor>>,
    /// Decides whether, and where, to launch a descriptor fetch.
    fetch: Arc<fetch::FetchScheduler>,
    /// Recent per-introduction-point failure history.
    ipfc: Arc<ipfc::Ipfc<clock::SystemClock>>,
    /// The current configuration, swapped as a whole on reconfigure.
    config: Arc<Mutex<Arc<config::HsClientConnectorConfig>>>,
    /// Circuit-layer operations (building, extending, and driving circuits).
    ///
    /// Circuits are named by [`tor_proto::circuit::UniqId`] at this
    /// boundary, rather than by the owned [`ClientCirc`] handle itself;
    /// [`ports::CircuitOps::take_client_circ`] resolves the final joined
    /// rendezvous circuit back to a real `ClientCirc`.
    circ_ops: ports::SharedCircuitOps<tor_proto::circuit::UniqId>,
    /// Launches anonymized directory fetches.
    dir_ops: Arc<dyn ports::DirectoryOps>,
    /// Parses raw descriptor bytes into [`connect::ParsedDescriptor`].
    parser: Arc<dyn ports::DescriptorParser<Descriptor = connect::ParsedDescriptor>>,
    /// Source of randomness used when picking an introduction point.
    rng: Arc<dyn ports::RandomSource>,
    /// Map from rendezvous cookie to the rendezvous circuit using it.
    rend_map: Arc<dyn ports::CircuitMap<tor_proto::circuit::UniqId>>,
    /// Directory information used to derive blinded keys, subcredentials,
    /// and responsible HSDirs.
    dirinfo: Arc<dyn fetch::DirectoryInfo>,
}

impl<R: Runtime> HsClientConnector<R, connect::Data> {
    /// Create a new `HsClientConnector`
    ///
    /// `circ_ops`, `dir_ops`, `parser`, `rend_map`, and `dirinfo` are the
    /// "ports" (see [`ports`](crate::ports)) through which this core talks
    /// to the real circuit-building, directory, and descriptor-parsing
    /// machinery; production callers wire these to `tor-circmgr`,
    /// `tor-dirclient`, and `tor-netdoc` respectively.
    //
    // TODO HS: will need a periodic task handle for us to expire old HS data/circuits
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: R,
        circmgr: Arc<CircMgr<R>>,
        netdir_provider: Arc<dyn NetDirProvider>,
        circ_ops: ports::SharedCircuitOps<tor_proto::circuit::UniqId>,
        dir_ops: Arc<dyn ports::DirectoryOps>,
        parser: Arc<dyn ports::DescriptorParser<Descriptor = connect::ParsedDescriptor>>,
        rend_map: Arc<dyn ports::CircuitMap<tor_proto::circuit::UniqId>>,
        dirinfo: Arc<dyn fetch::DirectoryInfo>,
        config: config::HsClientConnectorConfig,
    ) -> Result<Self, StartupError> {
        Ok(HsClientConnector {
            runtime,
            circmgr,
            netdir_provider,
            services: Arc::new(Mutex::new(Services::default())),
            mock_for_state: (),
            dcv: Arc::new(streams::Dcv::new()),
            fetch: Arc::new(fetch::FetchScheduler::new()),
            ipfc: Arc::new(ipfc::Ipfc::new(clock::SystemClock)),
            config: Arc::new(Mutex::new(Arc::new(config))),
            circ_ops,
            dir_ops,
            parser,
            rng: Arc::new(ports::OsRandomSource),
            rend_map,
            dirinfo,
        })
    }

    /// Return the currently active configuration.
    pub(crate) fn config(&self) -> Arc<config::HsClientConnectorConfig> {
        self.config.lock().expect("config poisoned").clone()
    }

    /// Replace the active configuration as a whole.
    pub fn reconfigure(&self, config: config::HsClientConnectorConfig) {
        *self.config.lock().expect("config poisoned") = Arc::new(config);
    }

    /// Discard all cached descriptors, fetch-scheduler bookkeeping, and
    /// introduction-point failure history, e.g. in response to `NEWNYM`.
    pub fn forget_all_cached_state(&self) {
        self.dcv.purge_all();
        self.fetch.purge_all();
        self.ipfc.purge_all();
    }

    /// Notify this connector that our view of the directory has changed
    /// (new consensus, new descriptors, or a guard/bridge status change).
    ///
    /// Retries the descriptor fetch for every service with a connection
    /// attempt currently in flight, per §4.6's "On directory info change"
    /// rule; callers that learn about directory changes (e.g. `tor-dirmgr`'s
    /// event stream) should invoke this so parked streams aren't left
    /// waiting on information that's since become available.
    pub fn dir_info_changed(&self) {
        let service_ids = {
            let services = match self.services.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            services.working_service_ids()
        };
        let streams: Vec<streams::PendingStream> = service_ids
            .into_iter()
            .map(|service_id| streams::PendingStream {
                service_id,
                state: streams::StreamState::RenddescWait,
            })
            .collect();
        let config = self.config();
        let outcome = streams::on_dir_info_changed(
            &streams,
            &self.fetch,
            &config,
            self.dirinfo.as_ref(),
            |service_id| {
                let (blinded_key, time_period) = self.dirinfo.blinded_key_and_period(service_id)?;
                let have_usable_desc = self.dcv.lookup(service_id).is_some();
                Some((blinded_key, time_period, have_usable_desc))
            },
        );
        tracing::debug!(
            retried = outcome.retried,
            "retried pending onion service descriptor fetches after a directory info change"
        );
    }

    /// Connect to a hidden service
    ///
    /// Each HS connection request must provide the appropriate
    /// client authentication keys to use -
    /// or [`default`](HsClientSecretKeys::default) if client auth is not required.
    //
    // This returns an explicit `impl Future` so that we can write the `Send` bound.
    // Without this, it is possible for `Services::get_or_launch_connection`
    // to not return a `Send` future.
    // https://gitlab.torproject.org/tpo/core/arti/-/merge_requests/1034#note_2881718
    pub fn get_or_launch_connection(
        &self,
        hs_id: HsId,
        secret_keys: HsClientSecretKeys,
        isolation: Box<dyn Isolation>,
    ) -> impl Future<Output = Result<ClientCirc, HsClientConnError>> + Send + Sync + '_ {
        Services::get_or_launch_connection(self, hs_id, isolation, secret_keys)
    }
}
