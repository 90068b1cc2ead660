use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

use scheduler_api::{create_app, AppState};
use scheduler_core::AppConfig;
use scheduler_dispatcher::{
    local_identity, DaemonTracker, ExecutionCoordinator, FilePipelineSource, LoggingAlertSink,
    PipelineRegistry, Stores,
};
use scheduler_domain::runnable::RunnableRegistry;
use scheduler_infrastructure::DatabaseManager;

const API_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 调度守护进程
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    registry: Arc<PipelineRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    daemon: Arc<DaemonTracker>,
}

impl Application {
    /// 连接数据库、加载管道配置并装配各组件
    pub async fn new(config: AppConfig, runnables: RunnableRegistry) -> Result<Self> {
        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        database.migrate().await.context("初始化数据库表失败")?;
        Self::with_database(config, runnables, database).await
    }

    /// 使用已迁移的数据库装配
    pub async fn with_database(
        config: AppConfig,
        runnables: RunnableRegistry,
        database: DatabaseManager,
    ) -> Result<Self> {
        let source = Arc::new(FilePipelineSource::new(&config.scheduler.pipelines_path));
        let registry = Arc::new(
            PipelineRegistry::load(source)
                .await
                .with_context(|| {
                    format!("加载管道配置失败: {}", config.scheduler.pipelines_path)
                })?,
        );
        for pipeline in registry.configs() {
            if !runnables.contains(&pipeline.entry_point) {
                warn!(
                    pipeline = %pipeline.name,
                    "管道入口 {} 未注册，触发时会直接失败",
                    pipeline.entry_point
                );
            }
        }

        let identity = local_identity();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            config.scheduler.clone(),
            identity.clone(),
            registry.clone(),
            Stores {
                jobs: database.job_store(),
                executions: database.execution_repository(),
                locks: database.resource_lock_repository(),
            },
            Arc::new(runnables),
            Arc::new(LoggingAlertSink),
        ));
        let daemon = Arc::new(DaemonTracker::new(
            database.daemon_state_repository(),
            identity,
            &config.scheduler,
        ));

        Ok(Self {
            config,
            database,
            registry,
            coordinator,
            daemon,
        })
    }

    pub fn coordinator(&self) -> Arc<ExecutionCoordinator> {
        self.coordinator.clone()
    }

    pub fn daemon(&self) -> Arc<DaemonTracker> {
        self.daemon.clone()
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let heartbeat_rx = shutdown_rx.resubscribe();
        let api_rx = shutdown_rx.resubscribe();
        let loop_rx = shutdown_rx.resubscribe();

        self.daemon
            .mark_starting(Some(self.registry.hash()), Utc::now())
            .await
            .context("抢占守护进程单例失败")?;

        let api = match self.start(api_rx).await {
            Ok(api) => api,
            Err(e) => {
                error!("启动失败: {:#}", e);
                if let Err(e) = self.daemon.mark_stopped(Utc::now()).await {
                    warn!("记录守护进程停止状态失败: {}", e);
                }
                return Err(e);
            }
        };

        let heartbeat = self.daemon.clone().spawn_heartbeat(heartbeat_rx);
        let scheduling = tokio::spawn(self.coordinator.clone().run(loop_rx));
        info!("调度守护进程已启动");

        let _ = shutdown_rx.recv().await;
        info!("开始优雅关闭");
        if let Err(e) = self.daemon.mark_stopping(Utc::now()).await {
            warn!("记录守护进程关闭状态失败: {}", e);
        }

        if let Err(e) = scheduling.await {
            error!("调度循环异常退出: {}", e);
        }
        if let Err(e) = heartbeat.await {
            warn!("心跳任务异常退出: {}", e);
        }
        if let Some(mut api) = api {
            if tokio::time::timeout(API_DRAIN_TIMEOUT, &mut api).await.is_err() {
                warn!("API连接未在 {:?} 内关闭，强制终止", API_DRAIN_TIMEOUT);
                api.abort();
            }
        }

        if let Err(e) = self.daemon.mark_stopped(Utc::now()).await {
            warn!("记录守护进程停止状态失败: {}", e);
        }
        self.database.close().await;
        info!("调度守护进程已停止");
        Ok(())
    }

    /// 恢复遗留状态、同步作业、启动对外服务并进入 running
    async fn start(&self, api_rx: broadcast::Receiver<()>) -> Result<Option<JoinHandle<()>>> {
        let report = self
            .coordinator
            .recovery()
            .recover_on_startup(Utc::now())
            .await
            .context("启动恢复失败")?;
        if !report.is_empty() {
            warn!(
                "已恢复上次运行遗留的 {} 个孤儿执行，清理 {} 个过期租约",
                report.orphaned.len(),
                report.purged_leases.len()
            );
        }

        let jobs = self
            .coordinator
            .sync_jobs(Utc::now())
            .await
            .context("同步调度作业失败")?;
        info!("已同步 {} 个调度作业", jobs);

        self.start_metrics_exporter()?;
        let api = if self.config.api.enabled {
            Some(self.spawn_api(api_rx).await?)
        } else {
            None
        };
        self.daemon
            .mark_running(Utc::now())
            .await
            .context("更新守护进程状态失败")?;
        Ok(api)
    }

    fn start_metrics_exporter(&self) -> Result<()> {
        if !self.config.observability.metrics_enabled {
            return Ok(());
        }
        let addr: SocketAddr = self
            .config
            .observability
            .metrics_bind_address
            .parse()
            .context("无效的指标监听地址")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("启动Prometheus导出器失败")?;
        info!("Prometheus指标导出已启动: http://{}/metrics", addr);
        Ok(())
    }

    async fn spawn_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        let bind_address = self.config.api.bind_address.clone();
        let listener = TcpListener::bind(&bind_address)
            .await
            .with_context(|| format!("绑定API地址失败: {bind_address}"))?;
        let app = create_app(AppState::new(self.coordinator.clone(), self.daemon.clone()));
        info!("API服务器监听: {}", bind_address);

        Ok(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = served {
                error!("API服务器运行失败: {}", e);
            }
        }))
    }
}
