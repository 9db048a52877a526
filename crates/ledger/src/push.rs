//! Websocket push subscription for account updates.

use async_trait::async_trait;
use comet_keeper_core::{AccountUpdate, Address, KeeperError, LedgerSubscriber, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::accounts::AccountSet;

const NOTIFICATION_METHOD: &str = "accountNotification";

#[derive(Debug, Deserialize)]
struct Notification {
    params: NotificationParams,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    result: AccountUpdate,
}

/// Parses one websocket frame. Subscription acks and other methods yield `None`.
///
/// # Errors
/// Returns `KeeperError::Serialization` if an account notification is malformed.
pub fn parse_notification(text: &str) -> Result<Option<AccountUpdate>> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| KeeperError::Serialization(e.to_string()))?;
    if value.get("method").and_then(|m| m.as_str()) != Some(NOTIFICATION_METHOD) {
        return Ok(None);
    }
    let notification: Notification =
        serde_json::from_value(value).map_err(|e| KeeperError::Serialization(e.to_string()))?;
    Ok(Some(notification.params.result))
}

/// Hands `update` to the cache without waiting. A full channel drops the
/// update: the loop re-reads every record at cycle start. Returns `false`
/// once the receiver is gone.
pub fn forward_update(tx: &mpsc::Sender<AccountUpdate>, update: AccountUpdate) -> bool {
    match tx.try_send(update) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            tracing::debug!(revision = dropped.revision(), "Cache channel full, dropping push update");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Subscribes to the manager, position, pools and oracle accounts and
/// forwards every notification. Reconnects after `reconnect_delay` when the
/// socket drops; returns once the receiver is gone.
#[derive(Debug, Clone)]
pub struct PushSubscriber {
    ws_url: String,
    accounts: AccountSet,
    reconnect_delay: Duration,
}

impl PushSubscriber {
    #[must_use]
    pub const fn new(ws_url: String, accounts: AccountSet) -> Self {
        Self {
            ws_url,
            accounts,
            reconnect_delay: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn watched(&self) -> [Address; 4] {
        [
            self.accounts.manager_info,
            self.accounts.position,
            self.accounts.pools,
            self.accounts.oracles,
        ]
    }

    /// Runs one connection until it closes. `Ok(true)` means the receiver
    /// was dropped and the subscription should stop.
    async fn run_connection(&self, tx: &mpsc::Sender<AccountUpdate>) -> Result<bool> {
        let (mut stream, response) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| KeeperError::Network(format!("websocket connect to {}: {e}", self.ws_url)))?;
        tracing::info!(url = %self.ws_url, status = %response.status(), "Push subscription connected");

        for (id, address) in self.watched().iter().enumerate() {
            let request = json!({
                "jsonrpc": "2.0",
                "id": id + 1,
                "method": "accountSubscribe",
                "params": [address],
            });
            stream
                .send(Message::Text(request.to_string()))
                .await
                .map_err(|e| KeeperError::Network(e.to_string()))?;
        }

        while let Some(msg) = stream.next().await {
            let msg = msg.map_err(|e| KeeperError::Network(e.to_string()))?;
            match msg {
                Message::Text(text) => match parse_notification(&text) {
                    Ok(Some(update)) => {
                        if !forward_update(tx, update) {
                            return Ok(true);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed account notification"),
                },
                Message::Ping(payload) => {
                    stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| KeeperError::Network(e.to_string()))?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl LedgerSubscriber for PushSubscriber {
    async fn subscribe(&self, tx: mpsc::Sender<AccountUpdate>) -> Result<()> {
        loop {
            match self.run_connection(&tx).await {
                Ok(true) => return Ok(()),
                Ok(false) => tracing::warn!("Push subscription closed, reconnecting"),
                Err(e) => tracing::error!(error = %e, "Push subscription failed, reconnecting"),
            }
            if tx.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_account_notifications() {
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "accountNotification",
            "params": {
                "subscription": 3,
                "result": {
                    "account": "position",
                    "data": {
                        "revision": 77,
                        "value": {"collateral": "1000", "entries": []}
                    }
                }
            }
        }"#;
        let update = parse_notification(text).unwrap().unwrap();
        assert_eq!(update.revision(), 77);
        assert!(matches!(update, AccountUpdate::Position(_)));
    }

    #[test]
    fn subscription_acks_are_skipped() {
        let text = r#"{"jsonrpc": "2.0", "id": 1, "result": 42}"#;
        assert!(parse_notification(text).unwrap().is_none());
    }

    fn oracle_update(revision: u64) -> AccountUpdate {
        AccountUpdate::Oracles(comet_keeper_core::Versioned::new(Vec::new(), revision))
    }

    #[test]
    fn full_cache_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward_update(&tx, oracle_update(1)));
        assert!(forward_update(&tx, oracle_update(2)));
        assert_eq!(rx.try_recv().unwrap().revision(), 1);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forward_update(&tx, oracle_update(3)));
    }

    #[test]
    fn malformed_notifications_are_errors() {
        let text = r#"{"method": "accountNotification", "params": {"result": {"account": "nope"}}}"#;
        assert!(parse_notification(text).is_err());
    }
}
