//! Tenant directory resolution
//!
//! A resolver turns a tenant identity into the list of host directories its workload
//! mounts. The first entry is the tenant's public directory (mounted read-write); the
//! remaining entries are site-wide extras in `path` or `path::ro` form.

use crate::config::{DirectoryBackend, DirectoryConfig, LdapConfig};
use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, Scope, SearchEntry};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a tenant's directories could not be resolved
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// No account exists for this identity
    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),
    /// The account exists but carries no usable home directory
    #[error("tenant '{0}' has no home directory")]
    NoHome(String),
    /// The directory service failed
    #[error("directory lookup failed: {0}")]
    Lookup(String),
}

impl From<ldap3::LdapError> for DirectoryError {
    fn from(err: ldap3::LdapError) -> Self {
        DirectoryError::Lookup(err.to_string())
    }
}

#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    /// Resolve an identity to its mount sources, primary directory first
    async fn resolve(&self, identity: &str) -> Result<Vec<String>, DirectoryError>;
}

pub type SharedResolver = Arc<dyn DirectoryResolver>;

/// Build the resolver selected in the configuration
pub fn from_config(config: &DirectoryConfig) -> anyhow::Result<SharedResolver> {
    let layout = MountLayout {
        public_dir: config.public_dir.clone(),
        extra_mounts: config.extra_mounts.clone(),
    };
    let resolver: SharedResolver = match config.backend {
        DirectoryBackend::Local => Arc::new(LocalAccountResolver::new(layout)),
        DirectoryBackend::Ldap => {
            let ldap = config
                .ldap
                .clone()
                .ok_or_else(|| anyhow::anyhow!("ldap backend requires a [directory.ldap] section"))?;
            Arc::new(LdapResolver::new(ldap, layout))
        }
    };
    Ok(resolver)
}

/// How a home directory becomes a mount list; shared by every backend
#[derive(Debug, Clone)]
pub struct MountLayout {
    pub public_dir: String,
    pub extra_mounts: Vec<String>,
}

impl MountLayout {
    fn sources(&self, home: &str) -> Vec<String> {
        let primary = Path::new(home).join(&self.public_dir);
        let mut sources = Vec::with_capacity(self.extra_mounts.len() + 1);
        sources.push(primary.to_string_lossy().into_owned());
        sources.extend(self.extra_mounts.iter().cloned());
        sources
    }
}

/// Home directory of a local account; `Ok(None)` when the account does not exist
type AccountLookup = Arc<dyn Fn(&str) -> Result<Option<String>, DirectoryError> + Send + Sync>;

/// Resolves tenants against the host's account database (NSS via `getpwnam_r`)
pub struct LocalAccountResolver {
    lookup: AccountLookup,
    layout: MountLayout,
}

impl LocalAccountResolver {
    pub fn new(layout: MountLayout) -> Self {
        Self {
            lookup: Arc::new(system_home),
            layout,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lookup(
        layout: MountLayout,
        lookup: impl Fn(&str) -> Result<Option<String>, DirectoryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            lookup: Arc::new(lookup),
            layout,
        }
    }
}

fn system_home(name: &str) -> Result<Option<String>, DirectoryError> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|e| DirectoryError::Lookup(format!("account lookup for '{}': {}", name, e)))?;
    Ok(user.map(|user| user.dir.to_string_lossy().into_owned()))
}

#[async_trait]
impl DirectoryResolver for LocalAccountResolver {
    async fn resolve(&self, identity: &str) -> Result<Vec<String>, DirectoryError> {
        // getpwnam_r may hit NSS modules that block on the network
        let lookup = Arc::clone(&self.lookup);
        let name = identity.to_string();
        let home = tokio::task::spawn_blocking(move || (*lookup)(&name))
            .await
            .map_err(|e| DirectoryError::Lookup(format!("account lookup task failed: {}", e)))??
            .ok_or_else(|| DirectoryError::UnknownTenant(identity.to_string()))?;

        if home.is_empty() {
            return Err(DirectoryError::NoHome(identity.to_string()));
        }
        debug!(identity, home = %home, "Resolved local account");
        Ok(self.layout.sources(&home))
    }
}

/// Home directory from the entries of a uid search.
///
/// The first entry carrying `home_attribute` wins.
fn home_from_entries(
    entries: Vec<SearchEntry>,
    home_attribute: &str,
    identity: &str,
) -> Result<String, DirectoryError> {
    if entries.is_empty() {
        return Err(DirectoryError::UnknownTenant(identity.to_string()));
    }
    entries
        .into_iter()
        .find_map(|mut entry| {
            entry
                .attrs
                .remove(home_attribute)
                .and_then(|values| values.into_iter().next())
        })
        .filter(|home| !home.is_empty())
        .ok_or_else(|| DirectoryError::NoHome(identity.to_string()))
}

/// Resolves tenants with an LDAP subtree search on the uid attribute
pub struct LdapResolver {
    config: LdapConfig,
    layout: MountLayout,
}

impl LdapResolver {
    pub fn new(config: LdapConfig, layout: MountLayout) -> Self {
        Self { config, layout }
    }

    fn filter(&self, identity: &str) -> String {
        format!("({}={})", self.config.uid_attribute, ldap_escape(identity))
    }
}

#[async_trait]
impl DirectoryResolver for LdapResolver {
    async fn resolve(&self, identity: &str) -> Result<Vec<String>, DirectoryError> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.config.url).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection error");
            }
        });

        if let (Some(dn), Some(password)) = (&self.config.bind_dn, &self.config.bind_password) {
            ldap.simple_bind(dn, password).await?.success()?;
        }

        let (entries, _) = ldap
            .search(
                &self.config.base_dn,
                Scope::Subtree,
                &self.filter(identity),
                vec![self.config.home_attribute.as_str()],
            )
            .await?
            .success()?;

        if let Err(e) = ldap.unbind().await {
            debug!(error = %e, "LDAP unbind failed");
        }

        let entries = entries.into_iter().map(SearchEntry::construct).collect();
        let home = home_from_entries(entries, &self.config.home_attribute, identity)?;
        debug!(identity, home = %home, "Resolved LDAP account");
        Ok(self.layout.sources(&home))
    }
}
