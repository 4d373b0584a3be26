use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consent_core::ServiceSettings;

/// Main entry point for the consent service
///
/// Resolves settings from the environment, restores the last snapshot and serves the REST API
/// until Ctrl-C, writing a final snapshot on the way out.
///
/// # Environment Variables
/// - `CONSENT_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `CONSENT_DATA_DIR`: directory holding `state.json` and the blob store (default: "consent_data")
/// - `CONSENT_IDENTITIES_FILE`: YAML identity directory; without it caller roles are unchecked
/// - `CONSENT_KEYRING_SECRET`: development keyring passphrase; without it keys are ephemeral
/// - `CONSENT_RESEAL_TIMEOUT_SECS`, `CONSENT_GRANT_CONCURRENCY`,
///   `CONSENT_IDENTITY_CACHE_TTL_SECS`: grant and cache tuning
///
/// # Returns
/// * `Ok(())` - If the server starts, runs and shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, startup or the final snapshot fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("consent_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("CONSENT_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let settings = ServiceSettings::from_lookup(|name| std::env::var(name).ok())?;
    tracing::info!(data_dir = %settings.core.data_dir().display(), "starting consent service");

    let service = Arc::new(settings.build()?);
    api_rest::serve(&rest_addr, service).await
}
