//! Actor front-end for the bracket manager
//!
//! The manager owns all group state and runs on a single task. Everything
//! else (the private stream, the CLI) talks to it through a cloneable
//! `BracketHandle`, so mutations are applied one at a time in arrival order.

use super::events::PrivateEvent;
use super::group::BracketGroup;
use super::manager::BracketManager;
use crate::services::bfx_errors::GatewayError;
use crate::services::gateway::OrderGateway;
use crate::types::{BracketRequest, OrderId};
use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default command queue depth
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum BracketCommand {
    Register {
        group_id: String,
        entry_id: Option<OrderId>,
        sl_id: Option<OrderId>,
        tp_id: Option<OrderId>,
    },
    Open {
        request: BracketRequest,
        reply: oneshot::Sender<Result<BracketGroup, GatewayError>>,
    },
    Event(PrivateEvent),
    Reset {
        delete_file: bool,
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(String, BracketGroup)>>,
    },
}

/// Cloneable sender side of the manager task
#[derive(Debug, Clone)]
pub struct BracketHandle {
    tx: mpsc::Sender<BracketCommand>,
}

impl BracketHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BracketCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Move the manager onto its own task
    pub fn spawn<G>(manager: BracketManager<G>, capacity: usize) -> (Self, JoinHandle<()>)
    where
        G: OrderGateway + 'static,
    {
        let (handle, rx) = Self::channel(capacity);
        let task = tokio::spawn(manager.run(rx));
        (handle, task)
    }

    async fn send(&self, command: BracketCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("bracket manager has stopped"))
    }

    pub async fn register_group(
        &self,
        group_id: impl Into<String>,
        entry_id: Option<OrderId>,
        sl_id: Option<OrderId>,
        tp_id: Option<OrderId>,
    ) -> Result<()> {
        self.send(BracketCommand::Register {
            group_id: group_id.into(),
            entry_id,
            sl_id,
            tp_id,
        })
        .await
    }

    pub async fn submit_event(&self, event: PrivateEvent) -> Result<()> {
        self.send(BracketCommand::Event(event)).await
    }

    pub async fn open_bracket(&self, request: BracketRequest) -> Result<BracketGroup> {
        let (reply, rx) = oneshot::channel();
        self.send(BracketCommand::Open { request, reply }).await?;
        let group = rx.await.map_err(|_| anyhow!("bracket manager dropped the reply"))??;
        Ok(group)
    }

    pub async fn reset(&self, delete_file: bool) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(BracketCommand::Reset { delete_file, reply }).await?;
        rx.await.map_err(|_| anyhow!("bracket manager dropped the reply"))
    }

    /// All tracked groups, sorted by group id
    pub async fn snapshot(&self) -> Result<Vec<(String, BracketGroup)>> {
        let (reply, rx) = oneshot::channel();
        self.send(BracketCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| anyhow!("bracket manager dropped the reply"))
    }
}

impl<G: OrderGateway> BracketManager<G> {
    /// Process commands until every handle is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<BracketCommand>) {
        info!("[Bracket] Manager running with {} groups", self.store().len());

        while let Some(command) = rx.recv().await {
            self.handle_command(command).await;
        }

        info!("[Bracket] Command channel closed, manager stopping");
    }

    async fn handle_command(&mut self, command: BracketCommand) {
        match command {
            BracketCommand::Register {
                group_id,
                entry_id,
                sl_id,
                tp_id,
            } => self.register_group(&group_id, entry_id, sl_id, tp_id),
            BracketCommand::Open { request, reply } => {
                let result = self.open_bracket(&request).await;
                if reply.send(result).is_err() {
                    debug!("[Bracket] Caller went away before group {} opened", request.group_id);
                }
            }
            BracketCommand::Event(event) => self.apply_event(event).await,
            BracketCommand::Reset { delete_file, reply } => {
                let _ = reply.send(self.reset(delete_file));
            }
            BracketCommand::Snapshot { reply } => {
                let mut groups: Vec<(String, BracketGroup)> = self
                    .store()
                    .groups()
                    .iter()
                    .map(|(gid, group)| (gid.clone(), group.clone()))
                    .collect();
                groups.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(groups);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BracketConfig;
    use crate::services::gateway::PaperGateway;
    use crate::services::metrics::Metrics;
    use rust_decimal_macros::dec;

    fn spawn_manager(dir: &tempfile::TempDir) -> (BracketHandle, JoinHandle<()>, PaperGateway) {
        let config = BracketConfig {
            partial_adjust: false,
            state_file: dir.path().join("brackets.json"),
        };
        let gateway = PaperGateway::new();
        let manager = BracketManager::new(gateway.clone(), &config, Metrics::new());
        let (handle, task) = BracketHandle::spawn(manager, 16);
        (handle, task, gateway)
    }

    #[tokio::test]
    async fn test_commands_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _task, _) = spawn_manager(&dir);

        handle.register_group("b", Some(3), None, None).await.unwrap();
        handle.register_group("a", Some(1), Some(2), None).await.unwrap();
        handle
            .submit_event(PrivateEvent::OrderClosed {
                order_id: 3,
                status: "CANCELED".to_string(),
            })
            .await
            .unwrap();

        let groups = handle.snapshot().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        assert!(groups[0].1.active);
        assert_eq!(groups[1].0, "b");
        assert!(!groups[1].1.active);
    }

    #[tokio::test]
    async fn test_open_then_fill_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _task, gateway) = spawn_manager(&dir);

        let group = handle
            .open_bracket(BracketRequest {
                group_id: "42".to_string(),
                symbol: "tETHUSD".to_string(),
                amount: dec!(-2),
                entry_price: Some(dec!(2000)),
                stop_loss_price: Some(dec!(2100)),
                take_profit_price: Some(dec!(1800)),
            })
            .await
            .unwrap();

        handle
            .submit_event(PrivateEvent::TradeExecuted {
                trade_id: Some(1),
                order_id: group.sl_id.unwrap(),
                exec_amount: dec!(2),
                exec_price: Some(dec!(2100)),
            })
            .await
            .unwrap();

        let groups = handle.snapshot().await.unwrap();
        assert!(!groups[0].1.active);
        // Entry still resting, take-profit cancelled
        assert_eq!(gateway.open_orders().await, 2);
        assert!(gateway.get_order_by_id(group.tp_id.unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _task, _) = spawn_manager(&dir);

        handle.register_group("a", Some(1), None, None).await.unwrap();
        assert_eq!(handle.reset(true).await.unwrap(), 1);
        assert!(handle.snapshot().await.unwrap().is_empty());
        assert!(!dir.path().join("brackets.json").exists());
    }

    #[tokio::test]
    async fn test_manager_stops_when_handles_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task, _) = spawn_manager(&dir);

        drop(handle);
        task.await.unwrap();
    }
}
