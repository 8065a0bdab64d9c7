#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use clap::Parser;
    use kvs_webrtc_signalling::{
        config::ServerConfig,
        control_plane::KinesisVideoControlPlane,
        server::{serve, ConfigService},
        signer::SigV4RequestSigner,
    };
    use log::info;

    pretty_env_logger::try_init()?;

    let config = ServerConfig::parse();
    let credentials = config.credentials();
    info!("channel '{}' in {}", config.channel_name, config.region);

    let control_plane = KinesisVideoControlPlane::new(&config.region, &credentials);
    let signer = SigV4RequestSigner::new(config.region.clone(), credentials);
    let service = Arc::new(ConfigService::new(
        control_plane,
        signer,
        config.region.clone(),
        config.channel_name.clone(),
    ));
    serve(service, config.bind, &config.static_dir).await?;
    Ok(())
}

#[cfg(not(feature = "server"))]
fn main() {
    println!("Must enable 'server' feature to run the `kvs-webrtc-signalling` config endpoint!");
}
