use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use certmgr::authority::CertificateAuthority;
use certmgr::circuit_breaker::CircuitBreakers;
use certmgr::config::AppConfig;
use certmgr::gateway::{AUTH_VERIFIER_BREAKER, SecurityGateway};
use certmgr::issuance::IssuanceService;
use certmgr::server::{self, Supervisor};
use certmgr::telemetry;
use certmgr::token_cache::TokenCache;
use certmgr::verifier::{AuthVerifier, DevModeAuthVerifier, GrpcAuthVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_with_layers().context("failed to load configuration")?;
    telemetry::init_tracing(&config.logging)?;

    let ca = CertificateAuthority::from_files(
        &config.ca.name,
        &config.ca.certificate_file,
        &config.ca.key_file,
        config.ca.bundle_file.as_deref(),
        config.ca_policy(),
    )
    .context("unable to load the signing CA")?;

    let verifier: Arc<dyn AuthVerifier> = if config.auth.dev_mode {
        warn!("auth dev mode is enabled: every bearer token is accepted");
        Arc::new(DevModeAuthVerifier)
    } else {
        Arc::new(GrpcAuthVerifier::connect(
            &config.auth.endpoint,
            config.connect_timeout(),
        )?)
    };

    let breakers = CircuitBreakers::default();
    breakers.configure(AUTH_VERIFIER_BREAKER, config.breaker_config()?);

    let cache = Arc::new(TokenCache::new(config.auth.cache_capacity));
    cache.start_sweeper(config.cache_sweep_interval());

    let gateway = SecurityGateway::new(verifier, &breakers, Arc::clone(&cache))
        .await
        .context("unable to configure the security gateway")?;
    let issuance = IssuanceService::new(Arc::new(ca), config.ca.authorized_creators.clone());
    let router = server::build_router(Arc::new(issuance), Arc::new(gateway));

    let listener = server::bind(config.listen_address()?).await?;
    let mut supervisor = Supervisor::new();
    supervisor.spawn_listener("http", listener, router);

    let reason = supervisor.run(server::shutdown_signal()).await;
    cache.shutdown().await;

    if let server::ShutdownReason::TaskFailed { task, error } = reason {
        bail!("{task} stopped: {error}");
    }
    info!("certmgr stopped");
    Ok(())
}
