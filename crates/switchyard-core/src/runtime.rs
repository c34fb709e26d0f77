//! バックグラウンドランタイム
//!
//! スーパーバイザーの定期処理を実行します:
//! - ハートビートループ: 自身のレコードを公開し、エージェントの生存を確認
//! - リーパーループ: 期限切れセッションと退役したスーパーバイザーを削除

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::supervisor::Supervisor;

/// ランタイムのハンドル
pub struct RuntimeHandle {
    /// ループ終了の送信側
    shutdown_tx: broadcast::Sender<()>,
    /// 実行中のループハンドル
    handle: JoinHandle<()>,
}

impl RuntimeHandle {
    /// 全ループを停止して終了を待つ
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// 定期処理ランタイム
pub struct Runtime {
    supervisor: Arc<Supervisor>,
    config: HeartbeatConfig,
}

impl Runtime {
    pub fn new(supervisor: Arc<Supervisor>, config: HeartbeatConfig) -> Self {
        Self { supervisor, config }
    }

    /// ハートビートとリーパーのループを起動
    pub fn start(self) -> RuntimeHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let shutdown_tx_clone = shutdown_tx.clone();

        let handle = tokio::spawn(async move {
            info!(
                supervisor = %self.supervisor.id(),
                interval_secs = self.config.interval_secs,
                "runtime loops starting"
            );

            let heartbeat = {
                let supervisor = self.supervisor.clone();
                let config = self.config.clone();
                let mut rx = shutdown_rx.resubscribe();
                tokio::spawn(async move {
                    run_heartbeat_loop(supervisor, config, &mut rx).await;
                })
            };

            let reaper = {
                let supervisor = self.supervisor.clone();
                let config = self.config.clone();
                let mut rx = shutdown_rx.resubscribe();
                tokio::spawn(async move {
                    run_reaper_loop(supervisor, config, &mut rx).await;
                })
            };

            let _ = heartbeat.await;
            let _ = reaper.await;

            info!(supervisor = %self.supervisor.id(), "runtime loops stopped");
        });

        RuntimeHandle {
            shutdown_tx: shutdown_tx_clone,
            handle,
        }
    }
}

/// ハートビートループの本体
///
/// 毎周期、自身のレコードを公開し、健康なハンドラーの鼓動を更新し、
/// 鼓動が途絶えたエージェントを降格させます。
async fn run_heartbeat_loop(
    supervisor: Arc<Supervisor>,
    config: HeartbeatConfig,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval()) => {
                if let Err(e) = supervisor.publish_heartbeat().await {
                    warn!(supervisor = %supervisor.id(), "heartbeat publish failed: {}", e);
                }

                supervisor.registry().beat_healthy();
                let swept = supervisor.registry().sweep_stale();
                if swept > 0 {
                    warn!(supervisor = %supervisor.id(), "{} agent(s) demoted to degraded", swept);
                }

                supervisor.prune_gates();
            }
            _ = shutdown_rx.recv() => {
                info!(supervisor = %supervisor.id(), "heartbeat loop shutting down");
                break;
            }
        }
    }
}

/// リーパーループの本体
///
/// 期限切れセッションを削除し、猶予期間を過ぎたスーパーバイザーの
/// レコードをディレクトリから取り除きます。
async fn run_reaper_loop(
    supervisor: Arc<Supervisor>,
    config: HeartbeatConfig,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.reaper_interval()) => {
                match supervisor.store().purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!("reaper removed {} expired session(s)", n),
                    Err(e) => warn!("session reap failed: {}", e),
                }

                match supervisor.directory().purge_stale(config.grace()).await {
                    Ok(0) => {}
                    Ok(n) => info!("purged {} long-dead supervisor record(s)", n),
                    Err(e) => warn!("directory purge failed: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!(supervisor = %supervisor.id(), "reaper loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::classify::KeywordClassifier;
    use crate::config::SupervisorConfig;
    use crate::directory::SupervisorDirectory;
    use crate::session::SessionStore;
    use crate::state::MemoryStore;

    fn test_supervisor(backend: Arc<MemoryStore>) -> Arc<Supervisor> {
        let store = SessionStore::new(backend.clone(), chrono::Duration::seconds(3600));
        let registry = Arc::new(AgentRegistry::new(chrono::Duration::seconds(90)));
        let directory = SupervisorDirectory::new(backend, chrono::Duration::seconds(90));
        let config = SupervisorConfig {
            id: "sup-rt".to_string(),
            address: "127.0.0.1:9001".to_string(),
            max_sessions: 4,
            dispatch_timeout_secs: 30,
            update_retries: 3,
        };
        Arc::new(Supervisor::new(
            &config,
            store,
            registry,
            directory,
            Arc::new(KeywordClassifier::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_publishes_record() {
        let backend = Arc::new(MemoryStore::new());
        let supervisor = test_supervisor(backend);
        let config = HeartbeatConfig {
            interval_secs: 1,
            liveness_multiplier: 3,
            grace_secs: 600,
            reaper_interval_secs: 3600,
        };

        let handle = Runtime::new(supervisor.clone(), config).start();

        // let a couple of ticks elapse on the paused clock
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        let record = supervisor.directory().find("sup-rt").await.unwrap();
        assert!(record.is_some());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_terminates_loops() {
        let backend = Arc::new(MemoryStore::new());
        let supervisor = test_supervisor(backend);
        let config = HeartbeatConfig {
            interval_secs: 1,
            liveness_multiplier: 3,
            grace_secs: 600,
            reaper_interval_secs: 1,
        };

        let handle = Runtime::new(supervisor, config).start();
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        // stop() resolves only once both loops have exited
        handle.stop().await;
    }
}
