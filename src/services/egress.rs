// src/services/egress.rs

//! Egress address routing.
//!
//! Discovers the host's outbound IPv4 addresses, probes each one against the
//! provider canary endpoints, and hands out a working source address for
//! outbound requests. Providers block individual addresses, not hosts, so a
//! multi-homed box keeps collecting by moving to the next address that still
//! answers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use tokio::process::Command;

use crate::models::{Config, Platform, ProbeResult};
use crate::services::truncate_detail;

/// Probes in flight at once during initialization.
const PROBE_CONCURRENCY: usize = 4;

/// Routes outbound requests over host addresses the providers still accept.
pub struct EgressRouter {
    config: Arc<Config>,

    /// Discovered candidate addresses, in `hostname -I` order
    addresses: Vec<IpAddr>,

    /// Addresses that probed working, per target, discovery order preserved
    working: HashMap<Platform, Vec<IpAddr>>,

    /// Raw outcomes of the last probe run
    probes: Vec<ProbeResult>,
}

impl EgressRouter {
    /// Create an empty router. Call [`initialize`](Self::initialize) before
    /// selecting addresses.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            addresses: Vec::new(),
            working: HashMap::new(),
            probes: Vec::new(),
        }
    }

    /// Discover candidate addresses and probe every (address, target) pair.
    ///
    /// Never fails: a host with no usable address for some target is recorded
    /// as such, and [`select`](Self::select) returns `None` for it. Requests
    /// then fail with `NO_AVAILABLE_ADDRESS` instead of the whole run
    /// aborting at startup.
    pub async fn initialize(&mut self) {
        self.addresses = discover_addresses().await;
        if self.addresses.is_empty() {
            log::warn!("no usable egress addresses discovered; provider requests will fail");
        } else {
            log::info!(
                "discovered {} candidate egress address(es)",
                self.addresses.len()
            );
        }

        let mut working: HashMap<Platform, Vec<IpAddr>> = HashMap::new();
        let mut probes = Vec::new();

        for target in Platform::ALL {
            // Probe concurrently; `buffered` keeps results in discovery
            // order, which is what makes selection deterministic later.
            let results: Vec<ProbeResult> = stream::iter(self.addresses.clone())
                .map(|address| self.probe(address, target))
                .buffered(PROBE_CONCURRENCY)
                .collect()
                .await;

            let mut usable = Vec::new();
            for probe in results {
                if probe.working {
                    usable.push(probe.address);
                } else if let Some(reason) = &probe.error {
                    log::debug!(
                        "egress {} not usable for {target}: {reason}",
                        probe.address
                    );
                }
                probes.push(probe);
            }
            log::info!(
                "egress: {}/{} address(es) working for {target}",
                usable.len(),
                self.addresses.len()
            );
            working.insert(target, usable);
        }

        self.working = working;
        self.probes = probes;
    }

    /// Probe one address against one target's canary endpoint.
    ///
    /// Working means the canary answered 2xx with a body large enough to be
    /// a real feed document rather than an empty block page.
    pub async fn probe(&self, address: IpAddr, target: Platform) -> ProbeResult {
        let canary = self.config.egress.canary_url(target);
        let error = self.canary_verdict(address, canary).await;
        ProbeResult {
            address,
            target,
            working: error.is_none(),
            error,
            tested_at: Utc::now(),
        }
    }

    async fn canary_verdict(&self, address: IpAddr, canary: &str) -> Option<String> {
        let client = match Client::builder()
            .local_address(address)
            .user_agent(&self.config.transport.user_agent)
            .timeout(Duration::from_secs(self.config.egress.probe_timeout_secs))
            .build()
        {
            Ok(client) => client,
            Err(e) => return Some(format!("client build failed: {e}")),
        };

        match client.get(canary).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => {
                        probe_verdict(status, body.len(), self.config.egress.min_probe_body_bytes)
                    }
                    Err(e) => Some(truncate_detail(&format!("body read failed: {e}"), 100)),
                }
            }
            Err(e) => Some(truncate_detail(&e.to_string(), 100)),
        }
    }

    /// First discovered address that probed working for `target` and is not
    /// in `excluding`. Selection order is stable across calls, so repeated
    /// requests reuse the same address until it gets blocked.
    pub fn select(&self, target: Platform, excluding: &[IpAddr]) -> Option<IpAddr> {
        self.working
            .get(&target)?
            .iter()
            .find(|address| !excluding.contains(address))
            .copied()
    }

    /// Whether any address probed working for `target`.
    pub fn has_addresses(&self, target: Platform) -> bool {
        self.working.get(&target).is_some_and(|v| !v.is_empty())
    }

    /// Outcomes of the last probe run, for persistence and inspection.
    pub fn probe_results(&self) -> &[ProbeResult] {
        &self.probes
    }

    /// Candidate addresses from discovery, working or not.
    pub fn candidate_addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Router with a pre-seeded working set, bypassing discovery and probing.
    #[cfg(test)]
    pub(crate) fn with_working(
        config: Arc<Config>,
        target: Platform,
        addresses: Vec<IpAddr>,
    ) -> Self {
        let mut working = HashMap::new();
        working.insert(target, addresses);
        Self {
            config,
            addresses: Vec::new(),
            working,
            probes: Vec::new(),
        }
    }
}

/// `None` means the canary answered like a real feed.
fn probe_verdict(status: u16, body_len: usize, min_len: usize) -> Option<String> {
    if !(200..300).contains(&status) {
        return Some(format!("HTTP {status}"));
    }
    if body_len <= min_len {
        return Some(format!("suspiciously small response ({body_len} bytes)"));
    }
    None
}

/// Outbound IPv4 addresses assigned to this host, via `hostname -I`.
async fn discover_addresses() -> Vec<IpAddr> {
    let output = match Command::new("hostname").arg("-I").output().await {
        Ok(output) => output,
        Err(e) => {
            log::error!("egress discovery failed to run hostname -I: {e}");
            return Vec::new();
        }
    };
    if !output.status.success() {
        log::error!("egress discovery: hostname -I exited with {}", output.status);
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter_map(parse_external_ipv4)
        .collect()
}

/// Parse one `hostname -I` token, keeping only external IPv4 addresses.
fn parse_external_ipv4(raw: &str) -> Option<IpAddr> {
    // hostname -I lists IPv6 addresses too
    if raw.contains(':') {
        return None;
    }
    let address: Ipv4Addr = raw.parse().ok()?;
    if address.is_loopback() {
        return None;
    }
    Some(IpAddr::V4(address))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn router_with(working: Vec<IpAddr>) -> EgressRouter {
        EgressRouter::with_working(Arc::new(Config::default()), Platform::AppStore, working)
    }

    #[test]
    fn test_parse_keeps_external_ipv4() {
        assert_eq!(
            parse_external_ipv4("203.0.113.10"),
            Some(addr("203.0.113.10"))
        );
        assert_eq!(parse_external_ipv4("10.0.0.7"), Some(addr("10.0.0.7")));
    }

    #[test]
    fn test_parse_rejects_ipv6_and_loopback() {
        assert_eq!(parse_external_ipv4("fe80::1"), None);
        assert_eq!(parse_external_ipv4("2001:db8::2"), None);
        assert_eq!(parse_external_ipv4("127.0.0.1"), None);
        assert_eq!(parse_external_ipv4("127.1.2.3"), None);
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        assert_eq!(parse_external_ipv4("10.0.0"), None);
        assert_eq!(parse_external_ipv4("999.1.1.1"), None);
        assert_eq!(parse_external_ipv4("not-an-address"), None);
        assert_eq!(parse_external_ipv4(""), None);
    }

    #[test]
    fn test_select_prefers_first_discovered() {
        let router = router_with(vec![addr("10.0.0.1"), addr("10.0.0.2"), addr("10.0.0.3")]);
        assert_eq!(
            router.select(Platform::AppStore, &[]),
            Some(addr("10.0.0.1"))
        );
        // Repeated selection is deterministic
        assert_eq!(
            router.select(Platform::AppStore, &[]),
            Some(addr("10.0.0.1"))
        );
    }

    #[test]
    fn test_select_skips_excluded() {
        let router = router_with(vec![addr("10.0.0.1"), addr("10.0.0.2"), addr("10.0.0.3")]);
        assert_eq!(
            router.select(Platform::AppStore, &[addr("10.0.0.1")]),
            Some(addr("10.0.0.2"))
        );
        assert_eq!(
            router.select(Platform::AppStore, &[addr("10.0.0.1"), addr("10.0.0.2")]),
            Some(addr("10.0.0.3"))
        );
    }

    #[test]
    fn test_select_none_when_all_excluded() {
        let router = router_with(vec![addr("10.0.0.1"), addr("10.0.0.2")]);
        let all = vec![addr("10.0.0.1"), addr("10.0.0.2")];
        assert_eq!(router.select(Platform::AppStore, &all), None);
    }

    #[test]
    fn test_select_unprobed_target_is_none() {
        let router = router_with(vec![addr("10.0.0.1")]);
        assert_eq!(router.select(Platform::PlayStore, &[]), None);
        assert!(!router.has_addresses(Platform::PlayStore));
        assert!(router.has_addresses(Platform::AppStore));
    }

    #[test]
    fn test_probe_verdict_requires_success_and_substance() {
        // Real feed: 2xx and a body above the floor
        assert_eq!(probe_verdict(200, 5000, 100), None);
        // Blocked outright
        assert!(probe_verdict(403, 5000, 100).is_some());
        // 2xx interstitial with a near-empty body
        assert!(probe_verdict(200, 40, 100).is_some());
        assert!(probe_verdict(204, 0, 100).is_some());
        // Boundary: the body must exceed the floor, not merely reach it
        assert!(probe_verdict(200, 100, 100).is_some());
        assert_eq!(probe_verdict(200, 101, 100), None);
    }
}
