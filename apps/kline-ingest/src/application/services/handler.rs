//! Ingest Handler
//!
//! The [`StreamHandler`] the connection drives. It only routes: responses
//! go to the applier worker, ticks and resubscribe requests to the relay
//! worker. Nothing here waits on a store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::StreamHandler;
use crate::application::services::admission::AdmissionControl;
use crate::application::services::relay::TickRelay;
use crate::domain::protocol::{Envelope, FetchResponse, OutboundFrame};

/// Routes connection events into the pipeline.
pub struct IngestHandler {
    admission: Arc<AdmissionControl>,
    responses: mpsc::Sender<FetchResponse>,
    relay: Option<Arc<TickRelay>>,
}

impl IngestHandler {
    /// Create a handler. `relay` is only set in runtime mode.
    #[must_use]
    pub const fn new(
        admission: Arc<AdmissionControl>,
        responses: mpsc::Sender<FetchResponse>,
        relay: Option<Arc<TickRelay>>,
    ) -> Self {
        Self {
            admission,
            responses,
            relay,
        }
    }

    /// Check whether an error reply belongs to a pending subscription.
    fn is_subscription_error(&self, response: &FetchResponse) -> bool {
        if response.status.is_ok() {
            return false;
        }
        self.relay
            .as_ref()
            .is_some_and(|relay| relay.claim_rejection(&response.id))
    }

    fn request_resubscribe(&self) {
        if let Some(relay) = &self.relay {
            relay.request_resubscribe();
        }
    }
}

#[async_trait]
impl StreamHandler for IngestHandler {
    async fn handle_open(&self, reconnect: bool) {
        if reconnect {
            let requeued = self.admission.reset_in_flight();
            tracing::info!(requeued, "Reconnected, released outstanding fetches");
        }
        self.request_resubscribe();
    }

    async fn handle_message(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) if self.is_subscription_error(&response) => {
                tracing::warn!(id = %response.id, status = ?response.status, "Subscription rejected");
            }
            Envelope::Response(response) => match self.responses.try_send(response) {
                Ok(()) => {}
                // The applier is behind; wait rather than lose a batch.
                Err(TrySendError::Full(response)) => {
                    if self.responses.send(response).await.is_err() {
                        tracing::warn!("Applier gone, dropping response");
                    }
                }
                Err(TrySendError::Closed(response)) => {
                    tracing::warn!(id = %response.id, "Applier gone, dropping response");
                }
            },
            Envelope::Tick(tick) => match &self.relay {
                Some(relay) => relay.forward_tick(tick),
                None => tracing::trace!(channel = %tick.channel, "Tick ignored outside runtime"),
            },
            Envelope::Subscribed { id, topic } => {
                if let (Some(relay), Some(id)) = (&self.relay, &id) {
                    relay.confirm_subscription(id);
                }
                tracing::debug!(id = ?id, topic = %topic, "Subscription confirmed");
            }
            Envelope::Unknown(text) => {
                tracing::trace!(message = %text, "Ignoring unrecognized message");
            }
        }
    }

    async fn handle_stale(&self) {
        self.request_resubscribe();
    }

    async fn handle_send_failure(&self, frame: &OutboundFrame, error: &str) {
        tracing::warn!(
            request_id = ?frame.request_id,
            error = %error,
            "Frame write failed, session will reconnect"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{ExchangeGateway, SendError};
    use crate::application::services::relay::{RelayCommand, RelaySettings};
    use crate::domain::market::{Granularity, SymbolState};
    use crate::domain::protocol::TickMessage;
    use crate::domain::task::FetchWindow;
    use crate::infrastructure::broadcast::BroadcastTickPublisher;
    use crate::infrastructure::exchange::{StreamConfig, StreamConnection};
    use crate::infrastructure::persistence::InMemoryKeyStore;
    use tokio_util::sync::CancellationToken;

    fn relay() -> (Arc<TickRelay>, mpsc::Receiver<RelayCommand>) {
        let (_connection, handle) = StreamConnection::new(
            StreamConfig::new("ws://127.0.0.1:9"),
            &CancellationToken::new(),
        );
        let (relay, commands) = TickRelay::new(
            Arc::new(InMemoryKeyStore::new()),
            Arc::new(handle),
            Arc::new(BroadcastTickPublisher::new(4)),
            RelaySettings::default(),
        );
        (Arc::new(relay), commands)
    }

    struct AcceptingGateway;

    #[async_trait]
    impl ExchangeGateway for AcceptingGateway {
        fn send(&self, _frame: OutboundFrame) -> Result<(), SendError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn wait_connected(&self) -> bool {
            true
        }

        fn stop(&self) {}
    }

    fn relay_over(store: Arc<InMemoryKeyStore>) -> (Arc<TickRelay>, mpsc::Receiver<RelayCommand>) {
        let (relay, commands) = TickRelay::new(
            store,
            Arc::new(AcceptingGateway),
            Arc::new(BroadcastTickPublisher::new(4)),
            RelaySettings::default(),
        );
        (Arc::new(relay), commands)
    }

    #[tokio::test]
    async fn responses_are_routed_to_the_applier() {
        let (tx, mut rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::new(AdmissionControl::new(2)), tx, None);

        let response = FetchResponse::ok("btcusdt_1min", vec![]);
        handler
            .handle_message(Envelope::Response(response.clone()))
            .await;
        assert_eq!(rx.recv().await, Some(response));
    }

    #[tokio::test]
    async fn reconnect_requeues_outstanding_fetches() {
        let admission = Arc::new(AdmissionControl::new(2));
        let (tx, _rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::clone(&admission), tx, None);

        let window = FetchWindow::new("btcusdt", Granularity::OneMinute, 0, 60);
        let permit = admission.acquire().await.unwrap();
        admission.register(window.clone(), permit);

        handler.handle_open(false).await;
        assert_eq!(admission.in_flight(), 1);

        handler.handle_open(true).await;
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(admission.available(), 2);
        assert_eq!(admission.take_requeued(), vec![window]);
    }

    #[tokio::test]
    async fn non_response_messages_are_not_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::new(AdmissionControl::new(2)), tx, None);

        handler
            .handle_message(Envelope::Subscribed {
                id: None,
                topic: "market.btcusdt.kline.1min".to_string(),
            })
            .await;
        handler
            .handle_message(Envelope::Unknown("{}".to_string()))
            .await;
        handler.handle_stale().await;
        drop(handler);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn stale_session_requests_one_throttled_sweep() {
        let (relay, mut commands) = relay();
        let (tx, _rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::new(AdmissionControl::new(2)), tx, Some(relay));

        handler.handle_stale().await;
        handler.handle_stale().await;

        assert!(matches!(commands.try_recv(), Ok(RelayCommand::Resubscribe)));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_error_does_not_release_a_fetch() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::Active);
        let (relay, _commands) = relay_over(store);
        relay.resubscribe().await.unwrap();

        let admission = Arc::new(AdmissionControl::new(2));
        let permit = admission.acquire().await.unwrap();
        admission.register(FetchWindow::new("btcusdt", Granularity::OneMinute, 0, 60), permit);
        let (tx, mut rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::clone(&admission), tx, Some(relay));

        let error = FetchResponse::error("btcusdt_1min", "bad-request", "invalid topic");
        handler.handle_message(Envelope::Response(error.clone())).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(admission.in_flight(), 1);

        // The next error for the same id is the fetch's own.
        handler.handle_message(Envelope::Response(error.clone())).await;
        assert_eq!(rx.recv().await, Some(error));
    }

    #[tokio::test]
    async fn acknowledged_subscription_leaves_errors_to_fetches() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::Active);
        let (relay, _commands) = relay_over(store);
        relay.resubscribe().await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::new(AdmissionControl::new(2)), tx, Some(relay));
        handler
            .handle_message(Envelope::Subscribed {
                id: Some("btcusdt_1min".to_string()),
                topic: "market.btcusdt.kline.1min".to_string(),
            })
            .await;

        let error = FetchResponse::error("btcusdt_1min", "bad-request", "invalid");
        handler.handle_message(Envelope::Response(error.clone())).await;
        assert_eq!(rx.recv().await, Some(error));
    }

    #[tokio::test]
    async fn ticks_go_to_the_relay() {
        let (relay, mut commands) = relay();
        let (tx, _rx) = mpsc::channel(4);
        let handler = IngestHandler::new(Arc::new(AdmissionControl::new(2)), tx, Some(relay));

        let tick = TickMessage {
            channel: "market.btcusdt.kline.1min".to_string(),
            raw: r#"{"ch":"market.btcusdt.kline.1min","tick":{"id":60}}"#.to_string(),
        };
        handler.handle_message(Envelope::Tick(tick.clone())).await;

        let Ok(RelayCommand::Tick(forwarded)) = commands.try_recv() else {
            panic!("expected a tick command");
        };
        assert_eq!(forwarded, tick);
    }
}
