//! Request/response and subscription replay against an in-process echo peer.
//!
//! Run with `RUST_LOG=debug cargo run -p hpx-messaging --example loopback`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hpx_messaging::{
    AccessToken, Adaptable, AuthenticationConfig, Channel, ChannelEvent, ConnectionEpoch,
    MessagingConfig, MessagingError, MessagingProvider, MessagingResult, Outbound,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Answers every JSON request with an acknowledgement carrying the same headers.
#[derive(Clone, Default)]
struct EchoPeer {
    events: Arc<Mutex<Option<mpsc::Sender<ChannelEvent>>>>,
}

#[async_trait]
impl Channel for EchoPeer {
    async fn connect(&self) -> MessagingResult<mpsc::Receiver<ChannelEvent>> {
        let (tx, rx) = mpsc::channel(32);
        tx.send(ChannelEvent::Connected {
            epoch: ConnectionEpoch(1),
        })
        .await
        .map_err(|_| MessagingError::channel("peer unavailable"))?;
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: Outbound) -> MessagingResult<()> {
        tracing::info!(payload = %message.payload, headers = ?message.headers, "Peer received");
        let Ok(request) = Adaptable::from_json(&message.payload) else {
            return Ok(());
        };
        let Some(id) = request.correlation_id() else {
            return Ok(());
        };
        let reply = Adaptable::new(json!({"status": 200, "echo": request.value()}))
            .with_correlation_id(&id)
            .to_json()?;
        let events = self.events.lock().clone();
        if let Some(events) = events {
            events
                .send(ChannelEvent::Message(reply))
                .await
                .map_err(|_| MessagingError::channel("peer unavailable"))?;
        }
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        self.events.lock().take();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let auth = AuthenticationConfig::access_token(|| async {
        Ok::<_, MessagingError>(AccessToken::expiring_in("demo-token", Duration::from_secs(60)))
    })
    .additional_header("x-client", "loopback");
    let config = MessagingConfig::default().timeout(Duration::from_secs(5));

    let provider = MessagingProvider::new(EchoPeer::default(), config, auth)?;
    provider.register_subscription_message("events", "START-SEND-EVENTS");
    provider.initialize().await?;

    let request = Adaptable::new(json!({"thing": "org.example:sensor"}))
        .with_topic("things/commands/retrieve");
    let response = provider.send_request(request).await?;
    println!("response: {}", response.value());

    provider.close().await?;
    Ok(())
}
