use async_channel::Sender;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::BridgeError;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Thinking,
}

/// Events delivered to the remote subscriber, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: String },
    Status { status: TurnStatus },
    Message { content: String },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<ErrorKind>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        /// `None` when the child was terminated by a signal.
        exit_code: Option<i32>,
        is_new_session: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionAborted { session_id: String, success: bool },
}

impl BridgeEvent {
    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
        }
    }

    pub fn thinking() -> Self {
        Self::Status {
            status: TurnStatus::Thinking,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            error_type: None,
        }
    }

    pub fn from_error(err: &BridgeError) -> Self {
        Self::Error {
            error: err.to_string(),
            error_type: err.kind(),
        }
    }
}

/// Outbound half of the message channel.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<BridgeEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<BridgeEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: BridgeEvent) {
        if let Err(err) = self.tx.send(event).await {
            debug!("event channel closed; dropping {:?}", err.0);
        }
    }

    pub async fn send_all(&self, events: impl IntoIterator<Item = BridgeEvent>) {
        for event in events {
            self.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn wire_shapes_match_client_contract() {
        let cases = vec![
            (
                BridgeEvent::SessionCreated {
                    session_id: "codex_1".into(),
                },
                json!({"type": "session-created", "sessionId": "codex_1"}),
            ),
            (
                BridgeEvent::thinking(),
                json!({"type": "status", "status": "thinking"}),
            ),
            (
                BridgeEvent::message("hi"),
                json!({"type": "message", "content": "hi"}),
            ),
            (
                BridgeEvent::error("boom"),
                json!({"type": "error", "error": "boom"}),
            ),
            (
                BridgeEvent::Complete {
                    exit_code: None,
                    is_new_session: true,
                },
                json!({"type": "complete", "exitCode": null, "isNewSession": true}),
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(serde_json::to_value(&event).expect("serialize"), expected);
        }
    }

    #[test]
    fn classified_errors_carry_error_type() {
        let event = BridgeEvent::from_error(&BridgeError::DirectoryNotFound {
            path: "/gone".into(),
        });
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["errorType"], "directory_not_found");
    }

    #[tokio::test]
    async fn closed_channel_is_not_fatal() {
        let (tx, rx) = async_channel::unbounded();
        drop(rx);
        EventSink::new(tx).send(BridgeEvent::message("lost")).await;
    }
}
