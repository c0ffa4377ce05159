//! Wire envelopes exchanged with clients and workers.
//!
//! Workers speak one JSON document per line. A reply carries either
//! `result_bytes` (the worker's output, passed through to the caller
//! byte for byte) or an `error_marker`. `result_bytes` is a JSON string for
//! text artifacts or an array of byte values for binary ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Artifact;
use crate::identity::ClientId;
use crate::scheduler::{Job, JobId, WorkerId};

/// Client → Broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: ClientId,
    pub job_id: JobId,
    pub function_name: String,
    pub json_args: Value,
}

/// Broker → Worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCall {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub call_template: String,
    pub json_args: Value,
}

impl WorkerCall {
    pub fn for_job(worker_id: WorkerId, job: &Job) -> Self {
        Self {
            worker_id,
            job_id: job.id,
            call_template: job.call.call_template(),
            json_args: job.call.json_args(),
        }
    }
}

/// Artifact payload of a successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultBytes {
    Text(String),
    Binary(Vec<u8>),
}

impl ResultBytes {
    /// Text when the bytes are valid UTF-8, a byte array otherwise.
    pub fn from_artifact(artifact: Artifact) -> Self {
        match String::from_utf8(artifact) {
            Ok(text) => ResultBytes::Text(text),
            Err(e) => ResultBytes::Binary(e.into_bytes()),
        }
    }

    pub fn into_artifact(self) -> Artifact {
        match self {
            ResultBytes::Text(text) => text.into_bytes(),
            ResultBytes::Binary(bytes) => bytes,
        }
    }
}

/// Worker → Broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_bytes: Option<ResultBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_marker: Option<String>,
}

impl WorkerReply {
    pub fn success(worker_id: WorkerId, job_id: JobId, artifact: impl Into<Artifact>) -> Self {
        Self {
            worker_id,
            job_id,
            result_bytes: Some(ResultBytes::from_artifact(artifact.into())),
            error_marker: None,
        }
    }

    pub fn failure(worker_id: WorkerId, job_id: JobId, marker: impl Into<String>) -> Self {
        Self {
            worker_id,
            job_id,
            result_bytes: None,
            error_marker: Some(marker.into()),
        }
    }

    pub fn into_outcome(self) -> Result<Artifact, String> {
        match (self.result_bytes, self.error_marker) {
            (_, Some(marker)) => Err(marker),
            (Some(result), None) => Ok(result.into_artifact()),
            (None, None) => Err("empty reply".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Ready,
    Heartbeat,
}

/// Worker → Broker readiness or liveness notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSignal {
    pub worker_id: WorkerId,
    pub signal: Signal,
}

/// Any line a worker may write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Reply(WorkerReply),
    Signal(WorkerSignal),
}

impl WorkerMessage {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerMessage::Reply(reply) => reply.worker_id,
            WorkerMessage::Signal(signal) => signal.worker_id,
        }
    }
}

/// What a worker proxy hands to the broker, independent of transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Ready,
    Heartbeat,
    Reply {
        job_id: JobId,
        outcome: Result<Artifact, String>,
    },
}

impl From<WorkerMessage> for WorkerEvent {
    fn from(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::Signal(WorkerSignal {
                signal: Signal::Ready,
                ..
            }) => WorkerEvent::Ready,
            WorkerMessage::Signal(WorkerSignal {
                signal: Signal::Heartbeat,
                ..
            }) => WorkerEvent::Heartbeat,
            WorkerMessage::Reply(reply) => WorkerEvent::Reply {
                job_id: reply.job_id,
                outcome: reply.into_outcome(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn parses_signal_lines() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"worker_id":3,"signal":"ready"}"#).unwrap();
        assert_eq!(msg.worker_id(), 3);
        assert_eq!(WorkerEvent::from(msg), WorkerEvent::Ready);

        let msg: WorkerMessage =
            serde_json::from_str(r#"{"worker_id":3,"signal":"heartbeat"}"#).unwrap();
        assert_eq!(WorkerEvent::from(msg), WorkerEvent::Heartbeat);
    }

    #[test]
    fn parses_reply_lines() {
        let job_id = Uuid::new_v4();
        let line = format!(r#"{{"worker_id":1,"job_id":"{}","result_bytes":"{{\"a\":1}}"}}"#, job_id);
        let msg: WorkerMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(
            WorkerEvent::from(msg),
            WorkerEvent::Reply {
                job_id,
                outcome: Ok(br#"{"a":1}"#.to_vec()),
            }
        );

        let line = format!(r#"{{"worker_id":1,"job_id":"{}","error_marker":"R error"}}"#, job_id);
        let msg: WorkerMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(
            WorkerEvent::from(msg),
            WorkerEvent::Reply {
                job_id,
                outcome: Err("R error".to_string()),
            }
        );
    }

    #[test]
    fn reply_without_payload_is_an_error() {
        let reply = WorkerReply {
            worker_id: 1,
            job_id: Uuid::new_v4(),
            result_bytes: None,
            error_marker: None,
        };
        assert_eq!(reply.into_outcome(), Err("empty reply".to_string()));
    }

    #[test]
    fn worker_call_serializes_all_fields() {
        let call = WorkerCall {
            worker_id: 2,
            job_id: Uuid::nil(),
            call_template: "f(a=a)".to_string(),
            json_args: json!({"a": null}),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(
            value,
            json!({
                "worker_id": 2,
                "job_id": "00000000-0000-0000-0000-000000000000",
                "call_template": "f(a=a)",
                "json_args": {"a": null}
            })
        );
    }

    #[test]
    fn successful_reply_omits_error_field() {
        let reply = WorkerReply::success(1, Uuid::nil(), "ok".as_bytes());
        let value = serde_json::to_value(&reply).unwrap();
        assert!(value.get("error_marker").is_none());
        assert_eq!(value["result_bytes"], "ok");
    }

    #[test]
    fn binary_results_survive_the_wire() {
        let artifact = vec![0x89, b'P', b'N', b'G', 0xff, 0x00];
        let reply = WorkerReply::success(4, Uuid::nil(), artifact.clone());
        let line = serde_json::to_string(&reply).unwrap();

        let msg: WorkerMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(
            WorkerEvent::from(msg),
            WorkerEvent::Reply {
                job_id: Uuid::nil(),
                outcome: Ok(artifact),
            }
        );
    }

    #[test]
    fn byte_array_result_lines_parse() {
        let line = r#"{"worker_id":1,"job_id":"00000000-0000-0000-0000-000000000000","result_bytes":[0,255,10]}"#;
        let msg: WorkerMessage = serde_json::from_str(line).unwrap();
        assert_eq!(
            WorkerEvent::from(msg),
            WorkerEvent::Reply {
                job_id: Uuid::nil(),
                outcome: Ok(vec![0, 255, 10]),
            }
        );
    }
}
