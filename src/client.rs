//! Resolving a broker client for a trigger's connection name.
//!
//! A connection name is an indirection into host settings. Two shapes are supported, checked in
//! this order:
//!
//! 1. `{name}__fullyQualifiedNamespace`: a namespace host name; the client authenticates with the
//!    ambient (managed) identity.
//! 2. `ConnectionStrings:{name}`: a full connection string with embedded credentials.
//!
//! Building the actual client is delegated to a [`ClientFactory`] supplied by the host.

use crate::broker::BrokerClient;
use crate::config::Settings;
use crate::error::PolicyError;
use std::fmt;
use std::sync::Arc;

/// How a client should authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum ClientCredentials {
    /// Namespace host name plus the ambient identity of the process.
    Namespace { fully_qualified_namespace: String },
    /// Connection string with embedded shared-access credentials.
    ConnectionString(String),
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace { fully_qualified_namespace } => f
                .debug_struct("Namespace")
                .field("fully_qualified_namespace", fully_qualified_namespace)
                .finish(),
            // connection strings carry secrets
            Self::ConnectionString(_) => f.debug_tuple("ConnectionString").field(&"<redacted>").finish(),
        }
    }
}

/// Builds broker clients from resolved credentials.
pub trait ClientFactory: Send + Sync + fmt::Debug {
    fn build(
        &self,
        connection_name: &str,
        credentials: ClientCredentials,
    ) -> Result<Arc<dyn BrokerClient>, PolicyError>;
}

/// Resolves a broker client for a named connection.
pub trait ClientResolver: Send + Sync + fmt::Debug {
    fn create_client(&self, connection_name: &str) -> Result<Arc<dyn BrokerClient>, PolicyError>;
}

/// Settings key for the namespace of `connection_name`.
pub fn namespace_key(connection_name: &str) -> String {
    format!("{connection_name}__fullyQualifiedNamespace")
}

/// Settings key for the connection string of `connection_name`.
pub fn connection_string_key(connection_name: &str) -> String {
    format!("ConnectionStrings:{connection_name}")
}

/// Look up credentials for `connection_name`. Namespace-based auth wins when both are set.
pub fn resolve_credentials(
    settings: &Settings,
    connection_name: &str,
) -> Result<ClientCredentials, PolicyError> {
    if let Some(namespace) = settings.get_non_empty(&namespace_key(connection_name)) {
        return Ok(ClientCredentials::Namespace {
            fully_qualified_namespace: namespace.trim().to_string(),
        });
    }
    let key = connection_string_key(connection_name);
    settings
        .get_non_empty(&key)
        .map(|cs| ClientCredentials::ConnectionString(cs.to_string()))
        .ok_or(PolicyError::MissingConfiguration { key })
}

/// Default resolver: settings lookup plus a host-supplied factory.
#[derive(Debug, Clone)]
pub struct ConfigClientResolver<F> {
    settings: Arc<Settings>,
    factory: F,
}

impl<F: ClientFactory> ConfigClientResolver<F> {
    pub fn new(settings: Arc<Settings>, factory: F) -> Self {
        Self { settings, factory }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl<F: ClientFactory> ClientResolver for ConfigClientResolver<F> {
    fn create_client(&self, connection_name: &str) -> Result<Arc<dyn BrokerClient>, PolicyError> {
        let credentials = resolve_credentials(&self.settings, connection_name)?;
        tracing::debug!(connection = connection_name, credentials = ?credentials, "creating broker client");
        self.factory.build(connection_name, credentials)
    }
}

/// Resolver that hands out one pre-built client for every connection name.
#[derive(Debug, Clone)]
pub struct StaticClientResolver {
    client: Arc<dyn BrokerClient>,
}

impl StaticClientResolver {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self { client }
    }
}

impl ClientResolver for StaticClientResolver {
    fn create_client(&self, _connection_name: &str) -> Result<Arc<dyn BrokerClient>, PolicyError> {
        Ok(self.client.clone())
    }
}
