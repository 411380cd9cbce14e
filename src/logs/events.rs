use serde::{Deserialize, Serialize};

use crate::models::views::{PodView, ServiceView};

use super::StreamMode;

/// Everything pushed to a WebSocket connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    LogData {
        job_name: String,
        pod_name: String,
        data: String,
        timestamp: String,
    },
    /// A chunk the tailer wrote to stderr.
    #[serde(rename_all = "camelCase")]
    LogError {
        job_name: String,
        pod_name: String,
        error: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    LogStreamStarted {
        job_name: String,
        pod_name: String,
        mode: StreamMode,
    },
    #[serde(rename_all = "camelCase")]
    LogStreamStopped { job_name: String, pod_name: String },
    #[serde(rename_all = "camelCase")]
    LogStreamClosed {
        job_name: String,
        pod_name: String,
        code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    LogStreamError {
        job_name: String,
        pod_name: String,
        error: String,
    },
    Pong { timestamp: i64 },
    StatusUpdate {
        pods: Vec<PodView>,
        services: Vec<ServiceView>,
        timestamp: i64,
    },
}

/// Messages accepted from a WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    StartLogStream { job_name: String, pod_name: String },
    #[serde(rename_all = "camelCase")]
    StopLogStream { job_name: String, pod_name: String },
    StopAllLogStreams,
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_with_camel_case_fields() {
        let event = ServerEvent::LogStreamClosed {
            job_name: "train".into(),
            pod_name: "train-0".into(),
            code: Some(0),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "log_stream_closed", "jobName": "train", "podName": "train-0", "code": 0})
        );

        let started = ServerEvent::LogStreamStarted {
            job_name: "train".into(),
            pod_name: "train-0".into(),
            mode: StreamMode::OnDemand,
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap()["mode"],
            json!("onDemand")
        );
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "start_log_stream", "jobName": "train", "podName": "train-0"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartLogStream {
                job_name: "train".into(),
                pod_name: "train-0".into()
            }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "reboot"}"#).is_err());
    }
}
