// src/vpn/routes.rs
//
// Split-tunnel site lists: literal addresses are routed at once, hostnames are
// resolved in the background and reported back one by one.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sys::traits::SiteResolver;

/// An IPv4 address or subnet, as opposed to a hostname.
pub fn is_ip_or_subnet(site: &str) -> bool {
    site.trim().parse::<Ipv4Network>().is_ok()
}

/// What to do with a site list right after the tunnel came up.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SitePlan {
    /// Routed immediately: literal entries and previously resolved addresses.
    pub addresses: Vec<String>,
    /// Resolved again on every connect; answers may have changed.
    pub hosts: Vec<String>,
}

pub fn plan_sites(sites: &BTreeMap<String, Option<String>>) -> SitePlan {
    let mut plan = SitePlan::default();
    for (site, cached) in sites {
        if is_ip_or_subnet(site) {
            plan.addresses.push(site.trim().to_string());
            continue;
        }
        if let Some(ip) = cached.as_deref().filter(|ip| is_ip_or_subnet(ip)) {
            plan.addresses.push(ip.to_string());
        }
        plan.hosts.push(site.clone());
    }
    let mut seen = std::collections::HashSet::new();
    plan.addresses.retain(|ip| seen.insert(ip.clone()));
    plan
}

pub fn first_ipv4(addrs: &[IpAddr]) -> Option<Ipv4Addr> {
    addrs.iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })
}

/// A finished lookup. `generation` ties it to the connection attempt that asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteResolved {
    pub generation: u64,
    pub site: String,
    pub address: Option<Ipv4Addr>,
}

/// Resolves every host concurrently. Each answer is sent to `tx` as soon as
/// it arrives, in whatever order the lookups finish.
pub fn resolve_sites<T>(resolver: Arc<dyn SiteResolver>, hosts: Vec<String>, generation: u64, tx: mpsc::UnboundedSender<T>)
where
    T: From<SiteResolved> + Send + 'static,
{
    for site in hosts {
        let resolver = resolver.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let address = match resolver.resolve(&site).await {
                Ok(addrs) => first_ipv4(&addrs),
                Err(err) => {
                    warn!(%site, error = %err, "site did not resolve");
                    None
                }
            };
            debug!(%site, ?address, "site resolved");
            let _ = tx.send(T::from(SiteResolved {
                generation,
                site,
                address,
            }));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeResolver;

    #[test]
    fn literal_entries_are_recognised() {
        assert!(is_ip_or_subnet("10.0.0.1"));
        assert!(is_ip_or_subnet("10.0.0.0/8"));
        assert!(!is_ip_or_subnet("example.org"));
        assert!(!is_ip_or_subnet("10.0.0.0/40"));
        assert!(!is_ip_or_subnet("::1"));
    }

    #[test]
    fn plan_splits_and_deduplicates() {
        let sites = BTreeMap::from([
            ("10.0.0.0/8".to_string(), None),
            ("example.org".to_string(), Some("93.184.216.34".to_string())),
            ("mirror.example.org".to_string(), Some("93.184.216.34".to_string())),
            ("fresh.example".to_string(), None),
        ]);
        let plan = plan_sites(&sites);
        assert_eq!(plan.addresses, vec!["10.0.0.0/8", "93.184.216.34"]);
        assert_eq!(plan.hosts, vec!["example.org", "fresh.example", "mirror.example.org"]);
    }

    #[test]
    fn only_ipv4_answers_are_used() {
        let addrs: Vec<IpAddr> = vec!["2001:db8::1".parse().unwrap(), "192.0.2.1".parse().unwrap()];
        assert_eq!(first_ipv4(&addrs), Some("192.0.2.1".parse().unwrap()));
        assert_eq!(first_ipv4(&addrs[..1]), None);
    }

    #[tokio::test]
    async fn every_host_reports_back() {
        let resolver = Arc::new(FakeResolver::default().with("a.example", &["192.0.2.1"]));
        let (tx, mut rx) = mpsc::unbounded_channel::<SiteResolved>();
        resolve_sites(resolver, vec!["a.example".into(), "b.example".into()], 7, tx);

        let mut results = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        results.sort_by(|a, b| a.site.cmp(&b.site));
        assert_eq!(
            results,
            vec![
                SiteResolved { generation: 7, site: "a.example".into(), address: Some("192.0.2.1".parse().unwrap()) },
                SiteResolved { generation: 7, site: "b.example".into(), address: None },
            ]
        );
    }
}
