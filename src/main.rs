use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use open_music_core::{
    audio::QueueManager, cache::SongManager, config::Config, notifier::LogNotifier, sources::SourceRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_core=debug".parse()?)
                .add_directive("songbird=info".parse()?)
                .add_directive("serenity=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Core v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("⚙️ {}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        SourceRegistry::verify_tools(&config.tools).await?;
        println!("OK");
        return Ok(());
    }

    let songs = SongManager::new(
        SourceRegistry::with_defaults(&config.tools, &config.song_manager),
        config.song_manager.clone(),
    );
    let refresh = songs.spawn_refresh_task();

    // Los avisos van al log; la capa de comandos instala su propio Notifier
    let rooms = QueueManager::new(
        songs.clone(),
        Arc::new(LogNotifier),
        config.queue.clone(),
        config.inactivity.clone(),
    );

    info!("🚀 Núcleo listo, esperando Ctrl+C");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error al registrar Ctrl+C: {}", e);
    }

    info!("⚠️ Señal de shutdown recibida, cerrando...");
    rooms.shutdown().await;
    songs.shutdown();
    if let Err(e) = refresh.await {
        error!("Tarea de refresco terminó con error: {}", e);
    }

    info!("👋 Open Music Core detenido");
    Ok(())
}
