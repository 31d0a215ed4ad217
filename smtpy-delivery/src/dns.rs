//! MX resolution for mail delivery.
//!
//! Implements MX record lookups with A/AAAA fallback per RFC 5321 section 5.1
//! and null MX detection per RFC 7505. Lookups go through the [`MxLookup`]
//! trait so the resolver can be swapped out; results are cached in a sharded
//! `DashMap` so a refresh of one domain never blocks readers of another.
//!
//! # Caching Strategy
//!
//! - Successful lookups are cached for `cache_ttl_secs` (default one hour),
//!   or for the record TTL bounded by `min_cache_ttl_secs` when
//!   `honor_record_ttl` is set
//! - Errors are never cached; a transient failure must not pin a domain
//! - [`MxResolver::invalidate`] drops an entry after every cached host failed

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use smtpy_common::Domain;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// The domain publishes a null MX and accepts no mail.
    #[error("Domain does not accept mail (null MX): {0}")]
    NullMx(String),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),

    /// DNS query failed due to network or resolver issues (SERVFAIL etc.).
    #[error("DNS lookup failed: {0}")]
    LookupFailed(String),

    /// The resolver could not be constructed.
    #[error("DNS resolver unavailable: {0}")]
    Resolver(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }

    /// Returns `true` if no later lookup can succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NoMailServers(_) | Self::NullMx(_) | Self::DomainNotFound(_)
        )
    }
}

/// Configuration for MX resolution and caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long a resolved host list stays cached, in seconds (default: 3600)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Use the record TTL instead of `cache_ttl_secs`, never below this
    /// minimum (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Cache for the DNS record TTL rather than the fixed `cache_ttl_secs`
    #[serde(default)]
    pub honor_record_ttl: bool,

    /// Port to deliver to on resolved hosts (default: 25)
    #[serde(default = "default_port")]
    pub port: u16,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    3600
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_port() -> u16 {
    25
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            honor_record_ttl: false,
            port: default_port(),
        }
    }
}

/// Represents a mail server target with its priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    /// The hostname or IP address of the mail server.
    pub host: String,
    /// MX priority (lower value = higher priority). 0 for A/AAAA fallback.
    pub priority: u16,
    /// Port number (default: 25).
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port,
        }
    }

    /// Returns the full address as `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// The answer to one MX query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecords {
    /// Hosts in the order the resolver returned them.
    pub servers: Vec<MailServer>,
    /// Smallest TTL across the answer records, if known.
    pub ttl: Option<u32>,
}

/// The DNS primitive behind [`MxResolver`].
#[async_trait]
pub trait MxLookup: Send + Sync + fmt::Debug {
    /// Look up the mail exchangers for `domain`, falling back to the domain's
    /// own address records when it publishes no MX.
    async fn lookup_mx(&self, domain: &str) -> Result<MxRecords, DnsError>;
}

/// [`MxLookup`] backed by the system resolver through hickory.
#[derive(Debug)]
pub struct HickoryMxLookup {
    resolver: TokioResolver,
    port: u16,
}

impl HickoryMxLookup {
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| DnsError::Resolver(e.to_string()))?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            port: config.port,
        })
    }

    /// Falls back to A/AAAA records when no MX records exist (RFC 5321).
    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<MxRecords, DnsError> {
        debug!("Attempting A/AAAA fallback for {domain}");

        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let ttl = ip_lookup.as_lookup().records().iter().map(|r| r.ttl()).min();

                let servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, self.port))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok(MxRecords { servers, ttl })
                }
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl MxLookup for HickoryMxLookup {
    async fn lookup_mx(&self, domain: &str) -> Result<MxRecords, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min();

                let servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        MailServer::new(mx.exchange().to_utf8(), mx.preference(), self.port)
                    })
                    .collect();

                if servers.is_empty() {
                    return self.fallback_to_a_aaaa(domain).await;
                }

                Ok(MxRecords { servers, ttl })
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records found for {domain}, falling back to A/AAAA");
                self.fallback_to_a_aaaa(domain).await
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err.to_string()))
            }
        }
    }
}

/// [`MxLookup`] answering from a fixed table. Domains missing from the
/// table resolve to [`DnsError::NoMailServers`].
#[derive(Debug, Default)]
pub struct StaticMxLookup {
    table: DashMap<Domain, Result<Vec<MailServer>, DnsError>>,
    queries: AtomicU64,
}

impl StaticMxLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `domain` with `servers`.
    #[must_use]
    pub fn with_servers(self, domain: &str, servers: Vec<MailServer>) -> Self {
        self.table.insert(Domain::new(domain), Ok(servers));
        self
    }

    /// Answer `domain` with an error.
    #[must_use]
    pub fn with_error(self, domain: &str, error: DnsError) -> Self {
        self.table.insert(Domain::new(domain), Err(error));
        self
    }

    /// Number of lookups served.
    #[must_use]
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MxLookup for StaticMxLookup {
    async fn lookup_mx(&self, domain: &str) -> Result<MxRecords, DnsError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        match self.table.get(&Domain::new(domain)).as_deref() {
            Some(Ok(servers)) => Ok(MxRecords {
                servers: servers.clone(),
                ttl: None,
            }),
            Some(Err(err)) => Err(err.clone()),
            None => Err(DnsError::NoMailServers(domain.to_string())),
        }
    }
}

/// MX cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Calls to [`MxResolver::resolve`].
    pub mx_lookups: u64,
    /// Calls answered from the cache.
    pub mx_cache_hits: u64,
    /// Queries issued to the underlying [`MxLookup`].
    pub dns_queries: u64,
    /// Entries currently cached (including expired ones not yet replaced).
    pub entries: usize,
}

/// Cached DNS result with expiration time.
#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// Resolves recipient domains to an ordered list of mail servers, caching
/// successful answers.
#[derive(Debug)]
pub struct MxResolver {
    lookup: Arc<dyn MxLookup>,
    cache: DashMap<Domain, CachedResult>,
    config: DnsConfig,
    mx_lookups: AtomicU64,
    mx_cache_hits: AtomicU64,
    dns_queries: AtomicU64,
}

impl MxResolver {
    #[must_use]
    pub fn new(lookup: Arc<dyn MxLookup>, config: DnsConfig) -> Self {
        Self {
            lookup,
            cache: DashMap::new(),
            config,
            mx_lookups: AtomicU64::new(0),
            mx_cache_hits: AtomicU64::new(0),
            dns_queries: AtomicU64::new(0),
        }
    }

    /// Resolver backed by the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system resolver cannot be initialised.
    pub fn system(config: DnsConfig) -> Result<Self, DnsError> {
        let lookup = HickoryMxLookup::new(&config)?;
        Ok(Self::new(Arc::new(lookup), config))
    }

    /// Resolves mail servers for a domain, sorted by ascending priority.
    /// Hosts with equal priority keep the resolver's order.
    ///
    /// # Errors
    ///
    /// Returns a permanent [`DnsError`] for domains that cannot receive mail
    /// and a temporary one for resolver trouble. Neither is cached.
    pub async fn resolve(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError> {
        self.mx_lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                self.mx_cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(%domain, servers = cached.servers.len(), "MX cache hit");
                return Ok(Arc::clone(&cached.servers));
            }
            debug!(%domain, "MX cache entry expired");
        }

        self.dns_queries.fetch_add(1, Ordering::Relaxed);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let records = tokio::time::timeout(timeout, self.lookup.lookup_mx(domain.as_str()))
            .await
            .map_err(|_| DnsError::Timeout(domain.to_string()))??;

        if is_null_mx(&records.servers) {
            return Err(DnsError::NullMx(domain.to_string()));
        }

        let mut servers: Vec<MailServer> = records
            .servers
            .into_iter()
            .filter(|s| !s.host.trim_end_matches('.').is_empty())
            .map(|mut s| {
                s.host = s.host.trim_end_matches('.').to_string();
                s
            })
            .collect();

        if servers.is_empty() {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }

        servers.sort_by_key(|s| s.priority);
        let servers = Arc::new(servers);

        let ttl = self.cache_ttl(records.ttl);
        self.cache.insert(
            domain.clone(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + ttl,
            },
        );

        debug!(
            %domain,
            servers = servers.len(),
            ttl_secs = ttl.as_secs(),
            "Cached MX result"
        );
        Ok(servers)
    }

    fn cache_ttl(&self, record_ttl: Option<u32>) -> Duration {
        let secs = match record_ttl {
            Some(ttl) if self.config.honor_record_ttl => {
                u64::from(ttl).max(self.config.min_cache_ttl_secs)
            }
            _ => self.config.cache_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    /// Drop the cached entry for `domain`, forcing the next resolve to query.
    pub fn invalidate(&self, domain: &Domain) {
        if self.cache.remove(domain).is_some() {
            debug!(%domain, "Invalidated MX cache entry");
        }
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            mx_lookups: self.mx_lookups.load(Ordering::Relaxed),
            mx_cache_hits: self.mx_cache_hits.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            entries: self.cache.len(),
        }
    }
}

/// RFC 7505: a single MX record whose exchange is the root.
fn is_null_mx(servers: &[MailServer]) -> bool {
    matches!(servers, [only] if only.host.trim_end_matches('.').is_empty())
}
