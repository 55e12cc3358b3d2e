//! Source route resolution over the mesh routing tree.
//!
//! The routing layer publishes each node's candidate parents; the resolver walks the
//! first-listed parent of every hop until it reaches a node with no entry, which is the
//! root. Reads take a shared lock so lookups run concurrently with each other but never
//! with a table update.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, instrument};

use crate::error::{constants, GatewayError, Result};

/// 64-bit node address (EUI-64)
pub type NodeAddress = [u8; 8];

/// Ordered list of hops from destination back to the root, both inclusive
pub type SourceRoute = Vec<NodeAddress>;

/// Render an address as colon-separated hex for logs and errors.
pub fn format_address(addr: &[u8]) -> String {
    let mut out = String::with_capacity(addr.len() * 3);
    for (i, byte) in addr.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Debug, Default)]
struct RoutingTable {
    parents: HashMap<NodeAddress, Vec<NodeAddress>>,
    root: Option<NodeAddress>,
}

/// Thread-safe parent table plus route lookup
#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    table: Arc<RwLock<RoutingTable>>,
}

impl RouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `node`'s candidate parents. Order is significant: the first entry is
    /// the one routes follow.
    pub fn update_parents(&self, node: NodeAddress, parents: Vec<NodeAddress>) -> Result<()> {
        let mut table = self
            .table
            .write()
            .map_err(|_| GatewayError::Custom(constants::ERR_ROUTING_WRITE_LOCK.into()))?;
        debug!(
            node = %format_address(&node),
            parents = parents.len(),
            "Updating parent set"
        );
        table.parents.insert(node, parents);
        Ok(())
    }

    /// Forget a node that left the network.
    pub fn remove_node(&self, node: &NodeAddress) -> Result<bool> {
        let mut table = self
            .table
            .write()
            .map_err(|_| GatewayError::Custom(constants::ERR_ROUTING_WRITE_LOCK.into()))?;
        Ok(table.parents.remove(node).is_some())
    }

    /// Record the mesh root so a route to the root itself resolves to `[root]`.
    pub fn set_root(&self, root: NodeAddress) -> Result<()> {
        let mut table = self
            .table
            .write()
            .map_err(|_| GatewayError::Custom(constants::ERR_ROUTING_WRITE_LOCK.into()))?;
        table.root = Some(root);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.parents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the source route from `destination` to the root.
    ///
    /// # Errors
    /// Returns `GatewayError::NoRoute` when `destination` is neither the root nor in the
    /// table, when a hop has an empty parent list, or when the walk exceeds the table
    /// size (a parent cycle).
    #[instrument(skip(self, destination), fields(destination = %format_address(destination)))]
    pub fn get_route_to(&self, destination: &NodeAddress) -> Result<SourceRoute> {
        let table = self
            .table
            .read()
            .map_err(|_| GatewayError::Custom(constants::ERR_ROUTING_READ_LOCK.into()))?;

        if table.root.as_ref() == Some(destination) {
            return Ok(vec![*destination]);
        }
        if !table.parents.contains_key(destination) {
            return Err(GatewayError::NoRoute(format!(
                "{}: unknown destination",
                format_address(destination)
            )));
        }

        let max_hops = table.parents.len();
        let mut route = vec![*destination];
        let mut current = *destination;

        while let Some(parents) = table.parents.get(&current) {
            let Some(&next) = parents.first() else {
                return Err(GatewayError::NoRoute(format!(
                    "{}: {} has no parent",
                    format_address(destination),
                    format_address(&current)
                )));
            };
            if route.len() > max_hops {
                error!(
                    hops = route.len(),
                    "Routing table contains a parent cycle"
                );
                return Err(GatewayError::NoRoute(format!(
                    "{}: parent cycle detected after {} hops",
                    format_address(destination),
                    route.len()
                )));
            }
            route.push(next);
            current = next;
        }

        debug!(hops = route.len(), "Resolved source route");
        Ok(route)
    }
}
