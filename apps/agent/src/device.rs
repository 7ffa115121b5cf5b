use std::time::Duration;

use peershare_common::constants::IP_LOOKUP_TIMEOUT_SECS;
use tracing::debug;

/// Static device description the host supplies for the handshake
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub country: String,
    pub carrier: String,
    pub model: String,
    pub os_version: String,
}

/// Seam for the host to describe the device. The core never inspects the
/// values; they ride in the `device_info` handshake envelope verbatim.
pub trait DeviceInfoProvider: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
}

/// Provider backed by a fixed description (CLI flags, config file)
#[derive(Debug, Clone)]
pub struct StaticDeviceInfo(pub DeviceInfo);

impl DeviceInfoProvider for StaticDeviceInfo {
    fn device_info(&self) -> DeviceInfo {
        self.0.clone()
    }
}

/// Plain-text IP echo endpoints, tried in order
const IP_SOURCES: [&str; 2] = ["https://api.ipify.org", "https://checkip.amazonaws.com"];

/// Best-effort public IP lookup for the handshake. Each source is bounded
/// by its own timeout; any failure falls through to the next source and
/// finally to `None`. Never fails the handshake.
pub async fn lookup_public_ip(client: &reqwest::Client) -> Option<String> {
    for source in IP_SOURCES {
        let attempt = async {
            let text = client.get(source).send().await.ok()?.text().await.ok()?;
            let ip = text.trim();
            ip.parse::<std::net::IpAddr>().ok().map(|_| ip.to_string())
        };
        match tokio::time::timeout(Duration::from_secs(IP_LOOKUP_TIMEOUT_SECS), attempt).await {
            Ok(Some(ip)) => return Some(ip),
            Ok(None) => debug!("IP source {} returned no usable address", source),
            Err(_) => debug!("IP source {} timed out", source),
        }
    }
    None
}
