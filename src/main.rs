use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use video_downloader::{
    AppState, ArtifactStore, Config, ProcessRunner, artifacts::StoreError, config::ConfigError,
    cors_layer, router,
};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No se pudo preparar la carpeta de descargas: {0}")]
    Store(#[from] StoreError),
    #[error("No se pudo iniciar el puerto {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Error del servidor HTTP: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        error!("Error del servidor: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;

    let store = ArtifactStore::open(&config.download_dir).await?;
    info!("Archivos se guardaran en {:?}", store.root());

    let runner = ProcessRunner::new(config.yt_dlp_bin.clone());
    info!("Herramienta de descarga: {:?}", runner.program());

    if !config.trust_proxy_headers {
        warn!(
            "TRUST_PROXY_HEADERS=false: se usara la IP del socket para limitar solicitudes."
        );
    }
    if config.allowed_origins.is_empty() {
        info!("ALLOWED_ORIGINS vacio: la API solo acepta solicitudes del mismo origen.");
    }

    let state = AppState::new(store, Arc::new(runner), &config);
    let app = router(state).layer(cors_layer(&config.allowed_origins));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;

    info!("Servidor listo en http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(StartupError::Serve)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("No se pudo escuchar la senal de apagado: {error}");
        std::future::pending::<()>().await;
    }
    info!("Apagando servidor");
}
