use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::common::data::DnsConfig;

/// Default cache lifetime over the OS resolver.
const DEFAULT_TTL: Duration = Duration::from_secs(10);
const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("cannot resolve {hostname}: {message}")]
    ResolutionFailed { hostname: String, message: String },
    #[error("no addresses found for {0}")]
    NoAddresses(String),
}

struct CacheEntry {
    result: Result<Vec<IpAddr>, Error>,
    expires: Instant,
}

/// TTL-bounded in-memory cache in front of hickory. Lookups are memoised per
/// hostname; an optional override server list takes precedence, falling back
/// to the OS resolver when it returns nothing.
pub struct CachingResolver {
    resolver: TokioAsyncResolver,
    fallback: Option<TokioAsyncResolver>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    max_ttl: Duration,
    error_ttl: Duration,
}

fn system_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
        log::warn!("cannot read system resolver config, using defaults: {}", err);
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

impl CachingResolver {
    /// The default resolver: OS configuration with a 10 second cache.
    pub fn default_resolver() -> Self {
        CachingResolver {
            resolver: system_resolver(),
            fallback: None,
            cache: Mutex::new(HashMap::new()),
            max_ttl: DEFAULT_TTL,
            error_ttl: DEFAULT_ERROR_TTL,
        }
    }

    pub fn from_config(config: &DnsConfig) -> Self {
        let resolver = match &config.servers {
            Some(servers) if !servers.is_empty() => {
                let group = NameServerConfigGroup::from_ips_clear(servers, 53, true);
                let resolver_config = ResolverConfig::from_parts(None, vec![], group);
                TokioAsyncResolver::tokio(resolver_config, ResolverOpts::default())
            }
            _ => system_resolver(),
        };
        let fallback = config
            .servers
            .as_ref()
            .filter(|servers| !servers.is_empty())
            .map(|_| system_resolver());

        CachingResolver {
            resolver,
            fallback,
            cache: Mutex::new(HashMap::new()),
            max_ttl: config.max_ttl.unwrap_or(DEFAULT_TTL),
            error_ttl: config.error_ttl.unwrap_or(DEFAULT_ERROR_TTL),
        }
    }

    /// Resolves a hostname to its addresses. IP literals short-circuit.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, Error> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(entry) = self.lookup_cached(hostname) {
            return entry;
        }

        let result = self.resolve_uncached(hostname).await;
        let ttl = if result.is_ok() {
            self.max_ttl
        } else {
            self.error_ttl
        };
        self.cache.lock().unwrap().insert(
            hostname.to_string(),
            CacheEntry {
                result: result.clone(),
                expires: Instant::now() + ttl,
            },
        );
        result
    }

    fn lookup_cached(&self, hostname: &str) -> Option<Result<Vec<IpAddr>, Error>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(hostname) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.result.clone()),
            Some(_) => {
                cache.remove(hostname);
                None
            }
            None => None,
        }
    }

    async fn resolve_uncached(&self, hostname: &str) -> Result<Vec<IpAddr>, Error> {
        let primary = self.resolver.lookup_ip(hostname).await;

        let ips: Vec<IpAddr> = match primary {
            Ok(lookup) => lookup.iter().collect(),
            Err(err) => {
                log::debug!("primary resolution of {} failed: {}", hostname, err);
                Vec::new()
            }
        };

        if !ips.is_empty() {
            return Ok(ips);
        }

        // Empty result from the override servers falls back to the OS.
        if let Some(fallback) = &self.fallback {
            let lookup = fallback.lookup_ip(hostname).await.map_err(|err| {
                Error::ResolutionFailed {
                    hostname: hostname.to_string(),
                    message: err.to_string(),
                }
            })?;
            let ips: Vec<IpAddr> = lookup.iter().collect();
            if !ips.is_empty() {
                return Ok(ips);
            }
        }

        Err(Error::NoAddresses(hostname.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ip_literals_resolve_without_lookup() {
        let resolver = CachingResolver::default_resolver();
        let ips = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let v6 = resolver.resolve("::1").await.unwrap();
        assert_eq!(v6, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn localhost_resolution_is_memoised() {
        let resolver = CachingResolver::default_resolver();
        let first = resolver.resolve("localhost").await;
        let second = resolver.resolve("localhost").await;

        match (first, second) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            // Containerised test environments occasionally lack resolution;
            // both calls must then agree via the error cache.
            (Err(_), Err(_)) => {}
            other => panic!("inconsistent cached results: {:?}", other),
        }
    }
}
