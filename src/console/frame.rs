//! # Console wire frames.
//!
//! JSON objects tagged by `type`, shared between the fabric and the
//! WebSocket layer. Server→client frames carry history, live output,
//! heartbeats, acks, and the stop notice; client→server frames carry
//! commands and heartbeat pongs.

use serde::{Deserialize, Serialize};

use super::line::ConsoleLine;

/// Frames pushed from the supervisor to a console subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Ring contents at subscription time, in insertion order.
    History { lines: Vec<ConsoleLine> },
    /// One live console line.
    Output { data: ConsoleLine },
    /// Liveness probe; the client answers with [`ClientFrame::Pong`].
    Heartbeat,
    /// Outcome of a submitted command, sent on the originating sink only.
    CommandAck {
        success: bool,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The managed child exited; the sink closes after this frame.
    ServerStopped { exit_code: Option<i32> },
    /// Terminal error for this sink.
    Error { message: String },
}

/// Frames received from a console subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Inject one command line into the child's stdin.
    Command { command: String },
    /// Heartbeat answer.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::line::{ConsoleLine, StreamKind};

    #[test]
    fn frames_serialize_with_type_tag() {
        let frame = Frame::Output {
            data: ConsoleLine::now(StreamKind::Stdout, "hello"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"]["stream"], "stdout");
        assert_eq!(json["data"]["line"], "hello");

        let json = serde_json::to_value(Frame::Heartbeat).unwrap();
        assert_eq!(json["type"], "heartbeat");

        let json = serde_json::to_value(Frame::ServerStopped {
            exit_code: Some(137),
        })
        .unwrap();
        assert_eq!(json["type"], "server_stopped");
        assert_eq!(json["exit_code"], 137);
    }

    #[test]
    fn stdin_echo_uses_kebab_case() {
        let frame = Frame::Output {
            data: ConsoleLine::now(StreamKind::StdinEcho, "say hi"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["data"]["stream"], "stdin-echo");
    }

    #[test]
    fn command_ack_omits_empty_message() {
        let json = serde_json::to_value(Frame::CommandAck {
            success: true,
            command: "say hi".into(),
            message: None,
        })
        .unwrap();
        assert!(json.get("message").is_none());
    }

    #[test]
    fn client_frames_parse() {
        let parsed: ClientFrame =
            serde_json::from_str(r#"{"type":"command","command":"stop"}"#).unwrap();
        assert!(matches!(parsed, ClientFrame::Command { command } if command == "stop"));

        let parsed: ClientFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(parsed, ClientFrame::Pong));
    }
}
