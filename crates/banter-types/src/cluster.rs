//! Cluster propagation hooks
//!
//! When a node changes a database-backed property it notifies its peers so
//! they can refresh their in-memory copies. Delivery is fire-and-forget:
//! a lost notification only delays convergence until the next restart.

/// Outbound propagation of property changes to cluster peers.
///
/// Implementations must not block; the property table invokes these from
/// its write path after local state is already committed.
pub trait ClusterPropagator: Send + Sync {
	/// A property was created or updated on this node.
	fn property_set(&self, name: &str, value: &str, encrypted: bool);

	/// A property (and its descendants) was deleted on this node.
	fn property_deleted(&self, name: &str);
}

// vim: ts=4
