// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validated endpoints and the descriptor → driver factory seam

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::backend::StorageDriver;
use crate::descriptor::StorageDescriptor;
use crate::error::StowResult;

/// A host that passed endpoint validation, with the exact addresses a driver
/// may connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// The string that was validated, as written in the config
    pub input: String,
    pub host: String,
    /// Port given explicitly or implied by a URL scheme
    pub port: Option<u16>,
    pub addrs: Vec<SocketAddr>,
}

impl ResolvedEndpoint {
    /// Addresses with `port` substituted, for callers that know the port
    /// better than the endpoint string did
    pub fn addrs_with_port(&self, port: u16) -> Vec<SocketAddr> {
        self.addrs
            .iter()
            .map(|addr| SocketAddr::new(addr.ip(), port))
            .collect()
    }
}

/// Builds live drivers from descriptors
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Every host or URL the driver for `descriptor` will contact
    fn endpoints(&self, descriptor: &StorageDescriptor) -> StowResult<Vec<String>> {
        Ok(descriptor.endpoint().into_iter().collect())
    }

    /// Construct a driver. `endpoints` holds one validated entry per string
    /// returned by [`BackendFactory::endpoints`], in the same order.
    async fn build(
        &self,
        descriptor: &StorageDescriptor,
        endpoints: &[ResolvedEndpoint],
    ) -> StowResult<Arc<dyn StorageDriver>>;
}
