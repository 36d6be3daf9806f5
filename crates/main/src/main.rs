//! 主应用程序入口
//!
//! 加载配置、连接数据库，组装实时通信核心并启动 Axum 服务。

use std::sync::Arc;

use application::{
    ChatService, ChatServiceDependencies, Clock, ConnectionGateway, ConversationRooms,
    DispatcherDependencies, GatewayDependencies, NotificationDispatcher, PresenceTracker,
    SystemClock, TypingCoordinator,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "configuration loaded");

    let infra = Infrastructure::connect(&config.database, &config.notifications).await?;
    let store = infra.message_store();
    let device_tokens = infra.device_tokens();
    let preferences = infra.preferences();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dispatcher = NotificationDispatcher::new(
        DispatcherDependencies {
            store: store.clone(),
            device_tokens: device_tokens.clone(),
            preferences: preferences.clone(),
            push: infra.push_provider(),
            clock: clock.clone(),
        },
        &config.notifications,
    );
    let workers = dispatcher.spawn_workers(config.notifications.workers);

    let presence = Arc::new(PresenceTracker::new());
    let rooms = Arc::new(ConversationRooms::new(
        presence.clone(),
        store.clone(),
        dispatcher.clone(),
    ));
    let typing = Arc::new(TypingCoordinator::new(
        rooms.clone(),
        config.realtime.typing_ttl(),
    ));
    let sweeper = typing
        .clone()
        .run_sweeper(config.realtime.typing_sweep_interval());

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        store: store.clone(),
        rooms: rooms.clone(),
        device_tokens,
        preferences,
        clock,
    }));
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let gateway = Arc::new(ConnectionGateway::new(
        GatewayDependencies {
            verifier: jwt_service.clone(),
            store,
            presence,
            rooms,
            typing,
            chat: chat_service.clone(),
        },
        config.realtime.outbound_buffer,
    ));

    let state = AppState::new(
        chat_service,
        gateway,
        jwt_service,
        config.realtime.clone(),
    );
    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(CorsLayer::permissive())
            .layer(CompressionLayer::new()),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "community realtime server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    for worker in workers {
        worker.abort();
        // 等待任务真正退出后再清点剩余任务
        let _ = worker.await;
    }
    dispatcher.shutdown().await;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}
