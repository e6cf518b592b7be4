use log::{info, warn};

pub const DEFAULT_PROBE_HOST: &str = "google.com:80";

/// Resolve a well-known host once to check the uplink. Diagnostic only,
/// the outcome never changes attach state.
pub async fn probe_reachability(host: &str) -> bool {
    match tokio::net::lookup_host(host).await {
        Ok(mut addresses) => match addresses.next() {
            Some(address) => {
                info!("probe: internet reachable, {} resolved to {}", host, address.ip());
                true
            }
            None => {
                warn!("probe: {} resolved to no addresses", host);
                false
            }
        },
        Err(e) => {
            warn!("probe: DNS lookup for {} failed: {}", host, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_address_resolves() {
        assert!(probe_reachability("127.0.0.1:80").await);
    }

    #[tokio::test]
    async fn test_malformed_host_is_unreachable() {
        assert!(!probe_reachability("no port here").await);
    }
}
