use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event envelope handed to sinks. `time` is RFC3339 with millisecond precision.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub event_version: String,
    pub payload: Value,
}

/// Broadcast bus for JSON-serializable events.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// only traced, and lagging subscribers lose the oldest envelopes.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        self.publish_value(kind, val);
    }

    pub fn publish_value(&self, kind: &str, mut payload: Value) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        if let Value::Object(map) = &mut payload {
            map.entry("event_version")
                .or_insert_with(|| Value::String(hcv_topics::EVENT_VERSION.to_string()));
            map.entry("iso_time")
                .or_insert_with(|| Value::String(now.clone()));
        }
        tracing::debug!(target: "hcv.events", kind, %payload, "event");
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            event_version: hcv_topics::EVENT_VERSION.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_stamps_version_and_time() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(
            hcv_topics::TOPIC_CONVERGE_PLANNED,
            &serde_json::json!({"profile": "default"}),
        );
        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.kind, "converge.planned");
        assert_eq!(env.event_version, "1");
        assert_eq!(env.payload["event_version"], "1");
        assert_eq!(env.payload["profile"], "default");
        assert!(env.payload["iso_time"].as_str().is_some());
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = Bus::default();
        bus.publish("slo.breach", &serde_json::json!({"slo": "x"}));
    }
}
