//! Configuration for the onion-service client core.

use std::collections::HashSet;

use tor_linkspec::{HasRelayIds, RelayIds};

/// A set of relays to avoid when selecting introduction or rendezvous
/// points, identified by any of their known identity keys.
///
/// This is a minimal stand-in for the real `RouterSet` type used by
/// higher-level Arti configuration; it is deliberately simple since this
/// core only ever needs membership tests.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExcludeNodes(HashSet<RelayIds>);

impl ExcludeNodes {
    /// Construct an empty `ExcludeNodes` (nothing excluded).
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct an `ExcludeNodes` from a list of relay identities.
    pub fn from_ids(ids: impl IntoIterator<Item = RelayIds>) -> Self {
        ExcludeNodes(ids.into_iter().collect())
    }

    /// Return true if `ids` shares any identity with an excluded relay.
    pub(crate) fn contains(&self, ids: &RelayIds) -> bool {
        self.0.iter().any(|excluded| {
            excluded
                .identities()
                .any(|id| ids.has_identity(id))
        })
    }
}

/// Configuration knobs for the onion-service client core.
///
/// Mirrors the three client-facing knobs named in the external-interfaces
/// section of the design: whether HS descriptor fetches are permitted at
/// all, which nodes to avoid when picking introduction/rendezvous points,
/// and whether that avoidance is a hard requirement ("strict") or only a
/// preference.
///
/// Reconfiguration happens by atomically swapping an entire
/// `HsClientConnectorConfig` behind the connector; there is no API for
/// mutating a single field in place.
#[derive(Clone, Debug)]
pub struct HsClientConnectorConfig {
    /// Whether this client is permitted to fetch onion service descriptors
    /// at all ("FetchHidServDescriptors" in the legacy configuration
    /// vocabulary).
    pub enabled: bool,

    /// Nodes to avoid using as introduction or rendezvous points.
    pub exclude_nodes: ExcludeNodes,

    /// If true, `exclude_nodes` is a hard constraint: if every candidate
    /// is excluded, selection fails rather than falling back to an
    /// excluded node.
    pub strict_nodes: bool,
}

impl Default for HsClientConnectorConfig {
    fn default() -> Self {
        HsClientConnectorConfig {
            enabled: true,
            exclude_nodes: ExcludeNodes::default(),
            strict_nodes: false,
        }
    }
}
