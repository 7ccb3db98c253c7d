use std::time::Duration;

use crate::client::GatewayClient;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded connectivity probe run once at startup (spec.md §4.1
/// "Initialization performs a bounded connectivity probe with exponential
/// backoff; failure to connect does not abort startup"). Returns whether
/// the Gateway answered before giving up.
pub async fn connectivity_probe(client: &GatewayClient) -> bool {
    let mut delay = BASE_DELAY;
    for attempt in 1..=MAX_ATTEMPTS {
        if client.stats().await.is_ok() {
            return true;
        }
        if attempt == MAX_ATTEMPTS {
            break;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
    false
}
