use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{field::Visit, Level, Subscriber};
use tracing_subscriber::Layer;
use webhook::client::WebhookClient;

// discord rejects longer messages
const MAX_MESSAGE: usize = 1900;

/// Forwards WARN and ERROR events to a chat webhook, so that operators notice
/// runtime failures and cheat detections during the game.
pub struct AlertLayer {
    event_tx: flume::Sender<String>,
}

impl AlertLayer {
    pub fn new(url: &str) -> Self {
        let client = WebhookClient::new(url);
        let (event_tx, event_rx) = flume::unbounded::<String>();

        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv_async().await {
                let mut backoff = Duration::from_secs(2);
                loop {
                    let Err(err) = client.send(|message| message.content(&event)).await else {
                        break;
                    };

                    // logging this through tracing would loop straight back here
                    eprintln!("failed to send webhook: {:?}", err);

                    if !format!("{:?}", err).contains("rate limited") {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        });

        Self { event_tx }
    }
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if event.metadata().level() > &Level::WARN {
            return;
        }

        let mut fields = BTreeMap::new();
        event.record(&mut Visitor(&mut fields));

        let message = fields
            .remove("message")
            .unwrap_or_else(|| "no message".to_string());

        let context = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");

        let mut msg = format!(
            "<t:{timestamp}:T> **{level}** `{target}`: {message} {context}",
            timestamp = chrono::Utc::now().timestamp(),
            level = event.metadata().level(),
            target = event.metadata().target(),
        );
        if msg.len() > MAX_MESSAGE {
            let mut cut = MAX_MESSAGE;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg.truncate(cut);
        }

        // receiver only goes away on shutdown
        let _ = self.event_tx.send(msg);
    }
}

struct Visitor<'a>(&'a mut BTreeMap<String, String>);

impl<'a> Visit for Visitor<'a> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_owned());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{:?}", value));
    }
}
