//! Joining an existing cluster.

use crate::http::JoinRequest;
use log::{info, warn};
use std::time::Duration;

/// Default pause between join attempts.
pub const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// URL of the join endpoint of the node reachable over HTTP at `target`.
pub fn join_url(target: &str) -> String {
    let target = target.trim_end_matches('/');
    if target.starts_with("http://") || target.starts_with("https://") {
        format!("{}/join", target)
    } else {
        format!("http://{}/join", target)
    }
}

/// Asks `target` to admit this node, retrying every `retry_interval` until
/// the request is accepted. Attempts are not capped and the interval is
/// fixed.
pub async fn join_cluster(target: &str, request: &JoinRequest, retry_interval: Duration) {
    let url = join_url(target);
    let client = reqwest::Client::new();
    let mut attempt = 1u64;
    loop {
        match client.post(&url).json(request).send().await {
            Ok(response) if response.status().is_success() => {
                info!("{} joined the cluster via {}", request.name, target);
                return;
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "join attempt {} via {} rejected ({}): {}",
                    attempt,
                    target,
                    status,
                    body.trim_end()
                );
            }
            Err(e) => warn!("join attempt {} via {} failed: {}", attempt, target, e),
        }
        attempt += 1;
        tokio::time::sleep(retry_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_adds_scheme_and_path() {
        assert_eq!(join_url("127.0.0.1:4001"), "http://127.0.0.1:4001/join");
        assert_eq!(join_url("http://node1:4001/"), "http://node1:4001/join");
    }
}
