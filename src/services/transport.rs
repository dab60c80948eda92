// src/services/transport.rs

//! Provider-facing HTTP transport.
//!
//! Sends requests through the egress router and classifies every response
//! into a recovery action. Blocked addresses are excluded and the request
//! moves to the next working address; rate limits are waited out on the same
//! address. Everything else comes back to the caller as a classified failure
//! for the next cycle to retry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{Config, ErrorCode, Platform, RequestOutcome};
use crate::services::{EgressRouter, truncate_detail};

/// How a raw HTTP status maps onto the failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Blocked,
    RateLimited,
    ServerError,
    Other,
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        403 => StatusClass::Blocked,
        429 => StatusClass::RateLimited,
        500..=599 => StatusClass::ServerError,
        _ => StatusClass::Other,
    }
}

/// What came out of waiting through a rate limit on one address.
enum RateLimitResult {
    /// A retry answered with something other than 429
    Cleared(u16, String),
    /// Every retry in the schedule answered 429 again
    StillLimited,
    /// A retry failed below HTTP (timeout, connection reset)
    SendFailed(String),
}

/// HTTP transport bound to the egress router.
///
/// Clients are cached per egress address so repeated requests reuse the same
/// connection pool and source-address binding.
pub struct ProviderTransport {
    config: Arc<Config>,
    router: Arc<EgressRouter>,
    clients: Mutex<HashMap<IpAddr, Client>>,
}

impl ProviderTransport {
    pub fn new(config: Arc<Config>, router: Arc<EgressRouter>) -> Self {
        Self {
            config,
            router,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// GET `url` for `target` and parse the body as JSON.
    ///
    /// Transport problems never surface as `Err`; every ending is folded into
    /// the returned [`RequestOutcome`] so callers can persist the
    /// classification as-is.
    pub async fn get_json(&self, url: &str, target: Platform) -> RequestOutcome {
        self.request(url, target, true).await
    }

    /// GET `url` for `target`, returning the raw body.
    pub async fn get_text(&self, url: &str, target: Platform) -> RequestOutcome {
        self.request(url, target, false).await
    }

    async fn request(&self, url: &str, target: Platform, parse_json: bool) -> RequestOutcome {
        let mut excluded: Vec<IpAddr> = Vec::new();
        let mut attempts: u32 = 0;

        loop {
            let Some(address) = self.router.select(target, &excluded) else {
                let detail = if excluded.is_empty() {
                    format!("no working egress address for {target}")
                } else {
                    format!(
                        "all {} egress address(es) for {target} are blocked",
                        excluded.len()
                    )
                };
                log::error!("{detail}");
                return RequestOutcome::failed(
                    ErrorCode::NoAvailableAddress,
                    detail,
                    None,
                    None,
                    attempts,
                );
            };

            let client = match self.client_for(address).await {
                Ok(client) => client,
                Err(e) => {
                    return RequestOutcome::failed(
                        ErrorCode::NetworkError,
                        format!("client build failed for {address}: {e}"),
                        None,
                        Some(address),
                        attempts,
                    );
                }
            };

            attempts += 1;
            let (status, body) = match send(&client, url).await {
                Ok(pair) => pair,
                Err(e) => {
                    let detail = describe_send_error(&e);
                    log::warn!("{target} request via {address} failed: {detail}");
                    return RequestOutcome::failed(
                        ErrorCode::NetworkError,
                        detail,
                        None,
                        Some(address),
                        attempts,
                    );
                }
            };

            match classify_status(status) {
                StatusClass::Success => {
                    return self.finish(status, body, parse_json, address, attempts);
                }
                StatusClass::Blocked => {
                    log::warn!("{target} blocked egress address {address} (HTTP 403), failing over");
                    excluded.push(address);
                    continue;
                }
                StatusClass::RateLimited => {
                    match self
                        .ride_out_rate_limit(&client, url, target, address, &mut attempts)
                        .await
                    {
                        RateLimitResult::Cleared(status, body) => match classify_status(status) {
                            StatusClass::Success => {
                                return self.finish(status, body, parse_json, address, attempts);
                            }
                            StatusClass::Blocked => {
                                log::warn!(
                                    "{target} blocked egress address {address} (HTTP 403), failing over"
                                );
                                excluded.push(address);
                                continue;
                            }
                            StatusClass::ServerError => {
                                return RequestOutcome::failed(
                                    ErrorCode::ServerError,
                                    format!("HTTP {status}"),
                                    Some(status),
                                    Some(address),
                                    attempts,
                                );
                            }
                            // Cleared never carries a 429; Other falls into
                            // the default network bucket
                            StatusClass::RateLimited | StatusClass::Other => {
                                return RequestOutcome::failed(
                                    ErrorCode::NetworkError,
                                    format!("unexpected HTTP {status}"),
                                    Some(status),
                                    Some(address),
                                    attempts,
                                );
                            }
                        },
                        RateLimitResult::StillLimited => {
                            return RequestOutcome::failed(
                                ErrorCode::RateLimited,
                                format!(
                                    "still rate limited after {} retries",
                                    self.config.transport.rate_limit_backoff_secs.len()
                                ),
                                Some(429),
                                Some(address),
                                attempts,
                            );
                        }
                        RateLimitResult::SendFailed(detail) => {
                            return RequestOutcome::failed(
                                ErrorCode::NetworkError,
                                detail,
                                None,
                                Some(address),
                                attempts,
                            );
                        }
                    }
                }
                StatusClass::ServerError => {
                    return RequestOutcome::failed(
                        ErrorCode::ServerError,
                        format!("HTTP {status}"),
                        Some(status),
                        Some(address),
                        attempts,
                    );
                }
                StatusClass::Other => {
                    return RequestOutcome::failed(
                        ErrorCode::NetworkError,
                        format!("unexpected HTTP {status}"),
                        Some(status),
                        Some(address),
                        attempts,
                    );
                }
            }
        }
    }

    /// Wait out a 429 on the same address, one schedule entry per retry.
    /// Stops at the first response that is not another 429.
    async fn ride_out_rate_limit(
        &self,
        client: &Client,
        url: &str,
        target: Platform,
        address: IpAddr,
        attempts: &mut u32,
    ) -> RateLimitResult {
        let schedule = &self.config.transport.rate_limit_backoff_secs;
        for (retry, &delay_secs) in schedule.iter().enumerate() {
            log::warn!(
                "{target} rate limited via {address}; waiting {delay_secs}s (retry {}/{})",
                retry + 1,
                schedule.len()
            );
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;

            *attempts += 1;
            match send(client, url).await {
                Ok((429, _)) => continue,
                Ok((status, body)) => return RateLimitResult::Cleared(status, body),
                Err(e) => return RateLimitResult::SendFailed(describe_send_error(&e)),
            }
        }
        RateLimitResult::StillLimited
    }

    fn finish(
        &self,
        status: u16,
        body: String,
        parse_json: bool,
        address: IpAddr,
        attempts: u32,
    ) -> RequestOutcome {
        if !parse_json {
            return RequestOutcome::succeeded(status, body, None, address, attempts);
        }
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => RequestOutcome::succeeded(status, body, Some(json), address, attempts),
            Err(e) => RequestOutcome::failed(
                ErrorCode::ParseError,
                truncate_detail(&format!("response is not valid JSON: {e}"), 500),
                Some(status),
                Some(address),
                attempts,
            ),
        }
    }

    /// Cached client bound to one egress address.
    async fn client_for(&self, address: IpAddr) -> Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&address) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .local_address(address)
            .user_agent(&self.config.transport.user_agent)
            .timeout(Duration::from_secs(self.config.transport.timeout_secs))
            .build()?;
        clients.insert(address, client.clone());
        Ok(client)
    }
}

async fn send(client: &Client, url: &str) -> std::result::Result<(u16, String), reqwest::Error> {
    let response = client.get(url).send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok((status, body))
}

/// Human-readable detail for a reqwest failure.
fn describe_send_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("request timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        truncate_detail(&format!("request failed: {error}"), 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn test_config(rate_limit_backoff_secs: Vec<u64>) -> Arc<Config> {
        let mut config = Config::default();
        config.transport.rate_limit_backoff_secs = rate_limit_backoff_secs;
        config.transport.timeout_secs = 5;
        Arc::new(config)
    }

    fn transport_over(config: Arc<Config>, addresses: Vec<IpAddr>) -> ProviderTransport {
        let router =
            EgressRouter::with_working(Arc::clone(&config), Platform::AppStore, addresses);
        ProviderTransport::new(config, Arc::new(router))
    }

    /// Loopback server answering each connection with the next scripted
    /// (status, body) pair, recording every caller's source address. The
    /// listener drops once the script runs out, so a request past the
    /// budget gets a connection error instead of hanging the test.
    async fn scripted_server(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<IpAddr>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/feed", listener.local_addr().unwrap());
        let peers = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&peers);

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, peer)) = listener.accept().await else {
                    return;
                };
                seen.lock().await.push(peer.ip());

                // Drain the request head before answering
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }

                let reason = match status {
                    200 => "OK",
                    403 => "Forbidden",
                    429 => "Too Many Requests",
                    500 => "Internal Server Error",
                    _ => "Other",
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, peers)
    }

    #[test]
    fn test_classify_status_table() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(201), StatusClass::Success);
        assert_eq!(classify_status(299), StatusClass::Success);
        assert_eq!(classify_status(403), StatusClass::Blocked);
        assert_eq!(classify_status(429), StatusClass::RateLimited);
        assert_eq!(classify_status(500), StatusClass::ServerError);
        assert_eq!(classify_status(503), StatusClass::ServerError);
        // Everything else lands in the default network bucket
        assert_eq!(classify_status(301), StatusClass::Other);
        assert_eq!(classify_status(404), StatusClass::Other);
        assert_eq!(classify_status(418), StatusClass::Other);
    }

    #[tokio::test]
    async fn test_request_without_addresses_fails_fast() {
        let config = Arc::new(Config::default());
        let router = Arc::new(EgressRouter::new(Arc::clone(&config)));
        let transport = ProviderTransport::new(config, router);

        let outcome = transport
            .get_json("https://example.com/feed", Platform::AppStore)
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::NoAvailableAddress));
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.address.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_address_until_schedule_runs_out() {
        let (url, peers) = scripted_server(vec![(429, ""), (429, ""), (429, "")]).await;
        let transport = transport_over(test_config(vec![0, 0]), vec![addr("127.0.0.1")]);

        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::RateLimited));
        assert_eq!(outcome.status, Some(429));
        // One initial request plus one retry per schedule entry
        assert_eq!(outcome.attempts, 3);
        let peers = peers.lock().await;
        assert_eq!(peers.len(), 3);
        assert!(peers.iter().all(|ip| *ip == addr("127.0.0.1")));
    }

    #[tokio::test]
    async fn test_rate_limit_stops_at_first_non_429() {
        // A 500 mid-schedule ends the ladder, it does not burn the rest of it
        let (url, peers) = scripted_server(vec![(429, ""), (500, "")]).await;
        let transport = transport_over(test_config(vec![0, 0, 0]), vec![addr("127.0.0.1")]);

        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::ServerError));
        assert_eq!(outcome.status, Some(500));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(peers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_clears_to_success() {
        let (url, peers) =
            scripted_server(vec![(429, ""), (200, r#"{"feed":{"entry":[]}}"#)]).await;
        let transport = transport_over(test_config(vec![0, 0, 0]), vec![addr("127.0.0.1")]);

        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(outcome.success);
        assert_eq!(outcome.status, Some(200));
        assert!(outcome.json.is_some());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(peers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_address_fails_over_to_next() {
        let (url, peers) =
            scripted_server(vec![(403, ""), (200, r#"{"feed":{"entry":[]}}"#)]).await;
        let transport = transport_over(
            test_config(vec![0]),
            vec![addr("127.0.0.1"), addr("127.0.0.2")],
        );

        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(outcome.success);
        assert_eq!(outcome.address, Some(addr("127.0.0.2")));
        assert_eq!(outcome.attempts, 2);
        // The 403 came over the first address, the success over the second
        assert_eq!(
            *peers.lock().await,
            vec![addr("127.0.0.1"), addr("127.0.0.2")]
        );
    }

    #[tokio::test]
    async fn test_blocked_addresses_exhaust_pool() {
        let (url, peers) = scripted_server(vec![(403, ""), (403, "")]).await;
        let transport = transport_over(
            test_config(vec![0]),
            vec![addr("127.0.0.1"), addr("127.0.0.2")],
        );

        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::NoAvailableAddress));
        // Exactly one attempt per pool member, never a second pass
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            *peers.lock().await,
            vec![addr("127.0.0.1"), addr("127.0.0.2")]
        );
        assert!(outcome.error_detail.unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn test_server_error_returns_without_retry() {
        let (url, peers) = scripted_server(vec![(500, "")]).await;
        let transport = transport_over(test_config(vec![0, 0]), vec![addr("127.0.0.1")]);

        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::ServerError));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(peers.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_returns_without_retry() {
        // Bind, then drop immediately so the port refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/feed", listener.local_addr().unwrap());
        drop(listener);

        let transport = transport_over(test_config(vec![0, 0]), vec![addr("127.0.0.1")]);
        let outcome = transport.get_json(&url, Platform::AppStore).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::NetworkError));
        assert_eq!(outcome.attempts, 1);
    }
}
