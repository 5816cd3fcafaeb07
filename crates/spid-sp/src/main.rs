use anyhow::Context;
use spid_sp::{IdentityProviderMetadata, ServiceProvider, ServiceProviderConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Loads and checks the SP configuration and IdP metadata, then prints the
/// SP metadata document for registration.
fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let config = ServiceProviderConfig::from_env()?;
    let metadata_path =
        std::env::var("IDP_METADATA_PATH").context("IDP_METADATA_PATH must be set")?;
    let metadata_bytes = std::fs::read(&metadata_path)
        .with_context(|| format!("failed to read IdP metadata {metadata_path}"))?;
    let idp = IdentityProviderMetadata::load(&metadata_bytes)
        .with_context(|| format!("invalid IdP metadata in {metadata_path}"))?;

    let sp = ServiceProvider::new(config, idp).context("invalid service provider setup")?;
    let xml = sp.metadata_xml()?;
    println!("{xml}");

    Ok(())
}
