//! Standalone REST server for the consent service.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run only the REST API
///
/// # Environment Variables
/// - `CONSENT_REST_ADDR`: listen address (default: "0.0.0.0:3000")
/// - `CONSENT_DATA_DIR`, `CONSENT_IDENTITIES_FILE`, `CONSENT_KEYRING_SECRET` and the tuning
///   variables read by [`api_rest::ServiceSettings::from_lookup`]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?)
                .add_directive("consent_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("CONSENT_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let settings = api_rest::ServiceSettings::from_lookup(|name| std::env::var(name).ok())?;
    tracing::debug!(?settings, "resolved settings");
    let service = Arc::new(settings.build()?);

    api_rest::serve(&rest_addr, service).await
}
