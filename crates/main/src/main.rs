//! 主应用程序入口
//!
//! 启动在线状态协调服务：装配存储适配器、用例服务和清扫任务，
//! 然后开放 Axum Web API。

use std::sync::Arc;
use std::time::Duration;

use application::{
    ActivityThrottle, InactivitySweeper, LocalPresenceBroadcaster, OnlineViewRegistry,
    PresenceService, PresenceServiceDependencies, SystemClock,
};
use config::AppConfig;
use infrastructure::{
    create_pg_pool, PgConversationRepository, PgPresenceRepository, PgSessionRepository,
};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_config = AppConfig::from_env_with_defaults();
    app_config.validate()?;

    tracing::info!(
        "连接数据库: {}",
        app_config
            .database
            .url
            .split('@')
            .last()
            .unwrap_or("unknown")
    );

    let pg_pool = create_pg_pool(&app_config.database.url, app_config.database.max_connections)
        .await?;

    // 运行迁移
    sqlx::migrate!("../../migrations").run(&pg_pool).await?;

    // 存储适配器
    let session_repository = Arc::new(PgSessionRepository::new(pg_pool.clone()));
    let presence_repository = Arc::new(PgPresenceRepository::new(pg_pool.clone()));
    let conversation_repository = Arc::new(PgConversationRepository::new(pg_pool));

    // 实时推送与在线视图订阅
    let broadcaster = Arc::new(LocalPresenceBroadcaster::new());
    let online_view = Arc::new(OnlineViewRegistry::new());

    let clock: Arc<dyn application::Clock> = Arc::new(SystemClock);
    let throttle = Arc::new(ActivityThrottle::new(Duration::from_secs(
        app_config.presence.activity_throttle_secs,
    )));

    let presence_service = Arc::new(PresenceService::new(PresenceServiceDependencies {
        session_repository: session_repository.clone(),
        presence_repository,
        conversation_repository,
        broadcaster: broadcaster.clone(),
        online_view: online_view.clone(),
        clock: clock.clone(),
        throttle,
    }));

    // 周期清扫任务
    let sweeper = Arc::new(InactivitySweeper::new(
        presence_service.clone(),
        session_repository,
        clock,
        app_config.presence.clone(),
    ));
    sweeper.spawn();

    // JWT 身份解析
    let jwt_service = Arc::new(JwtService::new(app_config.jwt.clone()));

    let state = AppState::new(presence_service, broadcaster, online_view, jwt_service);

    // 启动 Web 服务器
    let app = router(state);
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("在线状态服务启动在 http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
