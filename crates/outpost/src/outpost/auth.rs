use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::outpost::{
    config::OrganizationConfig,
    tunnel::{
        connection::{BandwidthLimit, TunnelMetadata},
        protocol::{self, OpenTunnel},
    },
};

/// What an authorized client is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub organization_id: Option<String>,
    pub bandwidth_limit: BandwidthLimit,
    pub record_id: Option<String>,
    pub custom_domains: Vec<String>,
}

impl Grant {
    pub fn anonymous() -> Self {
        Self {
            organization_id: None,
            bandwidth_limit: BandwidthLimit::Unlimited,
            record_id: None,
            custom_domains: Vec::new(),
        }
    }

    pub fn metadata(&self) -> TunnelMetadata {
        TunnelMetadata {
            organization_id: self.organization_id.clone(),
            bandwidth_limit: self.bandwidth_limit,
            record_id: self.record_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("api key required")]
    MissingApiKey,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("domain {0} is not allowed for this organization")]
    DomainNotAllowed(String),
}

impl AuthError {
    /// Wire error code sent to the client.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingApiKey | AuthError::InvalidApiKey => protocol::ERR_AUTH_FAILED,
            AuthError::DomainNotAllowed(_) => protocol::ERR_DOMAIN_NOT_ALLOWED,
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authorize(&self, req: &OpenTunnel) -> Result<Grant, AuthError>;
}

#[derive(Debug, Default)]
struct KeyTable {
    by_key: HashMap<String, Arc<OrganizationConfig>>,
    require_api_key: bool,
}

/// API keys from the config file. The table is swapped atomically on reload; in-flight
/// handshakes finish against the table they started with.
#[derive(Debug)]
pub struct StaticAuthenticator {
    table: ArcSwap<KeyTable>,
}

impl StaticAuthenticator {
    pub fn new(orgs: &[OrganizationConfig], require_api_key: bool) -> Self {
        Self {
            table: ArcSwap::from_pointee(build_table(orgs, require_api_key)),
        }
    }

    pub fn replace(&self, orgs: &[OrganizationConfig], require_api_key: bool) {
        self.table.store(Arc::new(build_table(orgs, require_api_key)));
        tracing::info!(
            organizations = orgs.len(),
            require_api_key,
            "auth: key table replaced"
        );
    }
}

fn build_table(orgs: &[OrganizationConfig], require_api_key: bool) -> KeyTable {
    let mut by_key = HashMap::new();
    for org in orgs {
        let org = Arc::new(org.clone());
        for key in &org.api_keys {
            by_key.insert(key.clone(), org.clone());
        }
    }
    KeyTable {
        by_key,
        require_api_key,
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authorize(&self, req: &OpenTunnel) -> Result<Grant, AuthError> {
        let table = self.table.load();

        let custom_domain = req
            .custom_domain
            .as_deref()
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());
        let key = req.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty());

        let org = match key {
            Some(key) => Some(table.by_key.get(key).ok_or(AuthError::InvalidApiKey)?),
            None if table.require_api_key => return Err(AuthError::MissingApiKey),
            None => None,
        };

        let Some(org) = org else {
            return match custom_domain {
                Some(domain) => Err(AuthError::DomainNotAllowed(domain)),
                None => Ok(Grant::anonymous()),
            };
        };

        if let Some(domain) = &custom_domain {
            if !org.custom_domains.iter().any(|d| d == domain) {
                return Err(AuthError::DomainNotAllowed(domain.clone()));
            }
        }

        // Records are looked up by the name the client asked for.
        let requested = custom_domain.or_else(|| {
            req.subdomain
                .as_deref()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
        });
        let record_id = requested.and_then(|name| org.records.get(&name).cloned());

        Ok(Grant {
            organization_id: Some(org.id.clone()),
            bandwidth_limit: BandwidthLimit::from_config(org.bandwidth_limit),
            record_id,
            custom_domains: org.custom_domains.clone(),
        })
    }
}
