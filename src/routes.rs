//! Route table construction
//!
//! Maps discovered platform endpoints and the static local routes to
//! `(subdomain, upstream)` pairs. Undiscovered endpoints still produce a
//! route (pointing at port 0) so that one missing service does not take the
//! whole table down; requests to that subdomain fail at the proxy instead.

use crate::config::ServerConfig;
use crate::status::{EndpointRecord, ServiceStatus};
use serde::Serialize;
use tracing::{debug, warn};

/// Logical upstreams the orchestrator knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RouteKey {
    PlatformApi,
    PlatformGraphql,
    PlatformStorage,
    PlatformStudio,
    PlatformMailbox,
    ServerApi,
    Frontend,
}

impl RouteKey {
    /// Every key, in the order routes are emitted
    pub const ALL: [RouteKey; 7] = [
        RouteKey::PlatformApi,
        RouteKey::PlatformGraphql,
        RouteKey::PlatformStorage,
        RouteKey::PlatformStudio,
        RouteKey::PlatformMailbox,
        RouteKey::ServerApi,
        RouteKey::Frontend,
    ];

    /// Subdomain label prepended to the base host
    pub fn label(&self) -> &'static str {
        match self {
            RouteKey::PlatformApi => "supabase-api",
            RouteKey::PlatformGraphql => "supabase-graphql",
            RouteKey::PlatformStorage => "supabase-storage",
            RouteKey::PlatformStudio => "supabase-studio",
            RouteKey::PlatformMailbox => "supabase-inbucket",
            RouteKey::ServerApi => "server-api",
            RouteKey::Frontend => "general",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RouteKey::PlatformApi => "Platform API",
            RouteKey::PlatformGraphql => "Platform GraphQL",
            RouteKey::PlatformStorage => "Platform Storage",
            RouteKey::PlatformStudio => "Platform Studio",
            RouteKey::PlatformMailbox => "Platform Inbucket",
            RouteKey::ServerApi => "Server API",
            RouteKey::Frontend => "Frontend",
        }
    }
}

/// One subdomain-to-upstream mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    /// Fully qualified host the proxy matches, e.g. `api.example.localhost`
    pub subdomain: String,
    /// `host:port[/path]` the proxy forwards to
    pub upstream: String,
    /// Human-readable name for logs
    pub label: String,
}

impl ProxyRoute {
    pub fn new(
        subdomain: impl Into<String>,
        upstream: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            subdomain: subdomain.into(),
            upstream: upstream.into(),
            label: label.into(),
        }
    }
}

/// Insertion-ordered map from route key to route
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteTable {
    entries: Vec<(String, ProxyRoute)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route. An existing key keeps its position and gets the new route.
    pub fn insert(&mut self, key: impl Into<String>, route: ProxyRoute) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = route,
            None => self.entries.push((key, route)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ProxyRoute> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, route)| route)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Routes in insertion order
    pub fn routes(&self) -> impl Iterator<Item = &ProxyRoute> {
        self.entries.iter().map(|(_, route)| route)
    }

    /// `(key, route)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProxyRoute)> {
        self.entries.iter().map(|(k, route)| (k.as_str(), route))
    }

    /// Routes grouped by subdomain.
    ///
    /// Groups appear in order of each subdomain's first route; routes keep
    /// insertion order within a group.
    pub fn grouped_by_subdomain(&self) -> Vec<(&str, Vec<&ProxyRoute>)> {
        let mut groups: Vec<(&str, Vec<&ProxyRoute>)> = Vec::new();
        for route in self.routes() {
            match groups.iter_mut().find(|(s, _)| *s == route.subdomain) {
                Some((_, routes)) => routes.push(route),
                None => groups.push((route.subdomain.as_str(), vec![route])),
            }
        }
        groups
    }
}

/// Format an endpoint as an upstream address
pub fn endpoint_upstream(endpoint: &EndpointRecord) -> String {
    let host = if endpoint.host.is_empty() {
        "localhost"
    } else {
        endpoint.host.as_str()
    };
    format!("{}:{}{}", host, endpoint.port, endpoint.path)
}

/// Builds the route table for one orchestration run
pub struct RouteTableBuilder<'a> {
    base_host: &'a str,
    server: &'a ServerConfig,
}

impl<'a> RouteTableBuilder<'a> {
    pub fn new(base_host: &'a str, server: &'a ServerConfig) -> Self {
        Self { base_host, server }
    }

    /// Fully qualified subdomain for a key
    pub fn subdomain(&self, key: RouteKey) -> String {
        format!("{}.{}", key.label(), self.base_host)
    }

    fn route(&self, key: RouteKey, upstream: String) -> ProxyRoute {
        ProxyRoute::new(self.subdomain(key), upstream, key.display_name())
    }

    /// Route every platform endpoint plus the local server and front-end
    pub fn build(&self, status: &ServiceStatus) -> RouteTable {
        let mut table = RouteTable::new();

        for key in RouteKey::ALL {
            let upstream = match key {
                RouteKey::PlatformApi => self.platform_upstream(key, &status.api),
                RouteKey::PlatformGraphql => self.platform_upstream(key, &status.graphql),
                RouteKey::PlatformStorage => self.platform_upstream(key, &status.s3_storage),
                RouteKey::PlatformStudio => self.platform_upstream(key, &status.studio),
                RouteKey::PlatformMailbox => self.platform_upstream(key, &status.inbucket),
                RouteKey::ServerApi => format!(
                    "{}:{}/{}",
                    self.server.host,
                    self.server.port,
                    self.server.api_route.trim_start_matches('/')
                ),
                RouteKey::Frontend => format!("localhost:{}", self.server.frontend_port),
            };
            let route = self.route(key, upstream);
            debug!(subdomain = %route.subdomain, upstream = %route.upstream, "Route built");
            table.insert(key.label(), route);
        }

        table
    }

    fn platform_upstream(&self, key: RouteKey, endpoint: &EndpointRecord) -> String {
        if !endpoint.is_discovered() {
            warn!(
                route = key.display_name(),
                "Endpoint not discovered, route will point at port 0"
            );
        }
        endpoint_upstream(endpoint)
    }
}
