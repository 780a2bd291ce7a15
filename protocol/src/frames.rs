use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Commands written to a worker's standard input, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Execute { code: String },
    Shutdown,
}

/// Messages a worker prints on its standard output, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Stdout {
        #[serde(default)]
        content: String,
    },
    Stderr {
        #[serde(default)]
        content: String,
    },
    Image {
        #[serde(default)]
        format: String,
        #[serde(default)]
        content: String,
    },
    /// Terminal frame of a successful execution.
    Result {
        #[serde(default)]
        output: Value,
    },
    /// Terminal frame of a failed execution.
    Error(ErrorDetail),
    Status {
        status: String,
    },
    ShutdownAck,
}

impl InboundFrame {
    const KNOWN_TYPES: [&'static str; 7] = [
        "stdout",
        "stderr",
        "image",
        "result",
        "error",
        "status",
        "shutdown_ack",
    ];

    pub fn is_known_type(frame_type: &str) -> bool {
        Self::KNOWN_TYPES.contains(&frame_type)
    }

    /// Whether the frame ends the execution currently in flight.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InboundFrame::Result { .. } | InboundFrame::Error(_))
    }

    /// The passthrough payload for frames that carry execution output.
    pub fn as_output(&self) -> Option<OutputChunk> {
        match self {
            InboundFrame::Stdout { content } => Some(OutputChunk::Stdout {
                content: content.clone(),
            }),
            InboundFrame::Stderr { content } => Some(OutputChunk::Stderr {
                content: content.clone(),
            }),
            InboundFrame::Image { format, content } => Some(OutputChunk::Image {
                format: format.clone(),
                content: content.clone(),
            }),
            _ => None,
        }
    }
}

/// Incremental output of an execution, forwarded as-is to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputChunk {
    Stdout { content: String },
    Stderr { content: String },
    Image { format: String, content: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }
}
