use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::prelude::IndexedRandom;
use tracing::info;
use wreq::Client;
use wreq_util::Emulation;

use revchat_provider_core::GatewayError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fingerprints rotated through on anti-bot challenges.
const EMULATIONS: &[Emulation] = &[
    Emulation::Chrome128,
    Emulation::Chrome131,
    Emulation::Chrome133,
    Emulation::Chrome134,
    Emulation::Chrome136,
];

/// Shared upstream transport for one gateway instance.
///
/// One browser-emulating client is reused across requests. A Cloudflare-class
/// challenge is evidence against the transport fingerprint, not the
/// credential, so `reset` swaps in a rebuilt client with a fresh emulation
/// profile while in-flight streams keep their old handle.
pub struct TransportSlot {
    proxy: Option<String>,
    client: ArcSwap<Client>,
}

impl TransportSlot {
    pub fn new(proxy: Option<String>) -> Result<Self, GatewayError> {
        let client = build_client(proxy.as_deref(), EMULATIONS[0])?;
        Ok(Self {
            proxy,
            client: ArcSwap::from_pointee(client),
        })
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.load_full()
    }

    pub fn reset(&self) -> Result<(), GatewayError> {
        let emulation = *EMULATIONS
            .choose(&mut rand::rng())
            .unwrap_or(&EMULATIONS[0]);
        let client = build_client(self.proxy.as_deref(), emulation)?;
        self.client.store(Arc::new(client));
        info!(event = "transport_reset", emulation = ?emulation, "rebuilt upstream client");
        Ok(())
    }
}

fn build_client(proxy: Option<&str>, emulation: Emulation) -> Result<Client, GatewayError> {
    let mut builder = Client::builder()
        .emulation(emulation)
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(proxy) = proxy {
        let proxy =
            wreq::Proxy::all(proxy).map_err(|err| GatewayError::Connection(err.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| GatewayError::Connection(err.to_string()))
}
