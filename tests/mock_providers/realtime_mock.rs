//! WebSocket Mock Server for the realtime upstream

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::fixtures::{OUTPUT_SAMPLE_RATE, encode_delta, generate_sine_wave, samples_to_pcm24_bytes};

/// Response id used by the scripted conversations
pub const MOCK_RESPONSE_ID: &str = "resp_mock_1";

/// Caption text of the scripted reply
pub const MOCK_REPLY_TEXT: &str = "Hello there!";

/// How a mock connection behaves after the handshake.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Send every data frame straight back
    Echo,
    /// Close with the given code after receiving `after` data frames
    CloseAfter {
        after: usize,
        code: u16,
        reason: String,
    },
    /// Drop the TCP connection after receiving `after` data frames
    DropAfter { after: usize },
    /// Scripted turn: answer the first appended audio with one PCM24 reply
    /// of `reply_ms` at 24 kHz, captions and `response.done`
    Conversation { reply_ms: u32 },
    /// Start a long reply, then report the user speaking over it after
    /// `interrupt_after_ms`; a `response.cancel` is answered with
    /// `response.done` status `cancelled`
    BargeIn {
        reply_ms: u32,
        interrupt_after_ms: u64,
    },
}

/// What the handshake carried.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
pub struct MockUpstreamState {
    pub connections: AtomicU64,
    pub handshakes: Mutex<Vec<HandshakeInfo>>,
    /// Text frames in arrival order, raw
    pub received_text: Mutex<Vec<String>>,
    pub received_binary: Mutex<Vec<Vec<u8>>>,
    pub pings: AtomicU64,
    pub client_closes: Mutex<Vec<Option<(u16, String)>>>,
}

impl MockUpstreamState {
    /// `type` of every JSON text frame received
    pub fn received_types(&self) -> Vec<String> {
        self.received_text
            .lock()
            .iter()
            .filter_map(|t| serde_json::from_str::<Value>(t).ok())
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn received_of_type(&self, event_type: &str) -> Vec<Value> {
        self.received_text
            .lock()
            .iter()
            .filter_map(|t| serde_json::from_str::<Value>(t).ok())
            .filter(|v| v["type"] == event_type)
            .collect()
    }

    /// Poll until a frame of `event_type` has arrived.
    pub async fn wait_for(&self, event_type: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.received_types().iter().any(|t| t == event_type) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Poll until at least `count` text frames have arrived.
    pub async fn wait_for_text_count(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.received_text.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub state: Arc<MockUpstreamState>,
    task: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockUpstreamState::default());

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state, behavior).await {
                        eprintln!("Mock upstream connection error: {}", e);
                    }
                });
            }
        });

        Self { addr, state, task }
    }

    /// Base URL for the relay configuration
    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockUpstreamState>,
    behavior: MockBehavior,
) -> Result<(), BoxError> {
    let handshake_state = state.clone();
    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        handshake_state.handshakes.lock().push(HandshakeInfo {
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            authorization: req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });
        Ok(resp)
    })
    .await?;
    let (mut write, mut read) = ws_stream.split();
    state.connections.fetch_add(1, Ordering::Relaxed);

    let mut data_frames = 0usize;
    let mut replied = false;

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };

        let text = match &msg {
            Message::Text(t) => {
                state.received_text.lock().push(t.as_str().to_string());
                Some(t.as_str().to_string())
            }
            Message::Binary(b) => {
                state.received_binary.lock().push(b.to_vec());
                None
            }
            Message::Ping(_) => {
                state.pings.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Message::Close(frame) => {
                state
                    .client_closes
                    .lock()
                    .push(frame.as_ref().map(|f| (u16::from(f.code), f.reason.as_str().to_string())));
                break;
            }
            _ => continue,
        };
        data_frames += 1;
        let event: Value = text
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or(Value::Null);

        match &behavior {
            MockBehavior::Echo => {
                write.send(msg).await?;
            }

            MockBehavior::CloseAfter {
                after,
                code,
                reason,
            } => {
                if data_frames >= *after {
                    write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(*code),
                            reason: reason.clone().into(),
                        })))
                        .await?;
                    // wait for the close echo
                    while let Some(Ok(msg)) = read.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                    return Ok(());
                }
            }

            MockBehavior::DropAfter { after } => {
                if data_frames >= *after {
                    return Ok(());
                }
            }

            MockBehavior::Conversation { reply_ms } => {
                match event["type"].as_str() {
                    Some("session.update") => {
                        send_json(&mut write, json!({"type": "session.updated", "session": event["session"]})).await?;
                    }
                    Some("input_audio_buffer.append") if !replied => {
                        replied = true;
                        send_json(&mut write, json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 0, "item_id": "item_1"})).await?;
                        send_json(&mut write, json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 200, "item_id": "item_1"})).await?;
                        send_json(&mut write, json!({"type": "conversation.item.input_audio_transcription.completed", "item_id": "item_1", "transcript": "hi"})).await?;
                        send_reply(&mut write, *reply_ms).await?;
                        for delta in ["Hello", " there!"] {
                            send_json(&mut write, json!({"type": "response.audio_transcript.delta", "response_id": MOCK_RESPONSE_ID, "delta": delta})).await?;
                        }
                        send_json(&mut write, json!({"type": "response.audio_transcript.done", "response_id": MOCK_RESPONSE_ID, "transcript": MOCK_REPLY_TEXT})).await?;
                        send_json(&mut write, json!({"type": "response.audio.done", "response_id": MOCK_RESPONSE_ID})).await?;
                        send_json(&mut write, json!({"type": "response.done", "response": {"id": MOCK_RESPONSE_ID, "status": "completed"}})).await?;
                    }
                    _ => {}
                }
            }

            MockBehavior::BargeIn {
                reply_ms,
                interrupt_after_ms,
            } => match event["type"].as_str() {
                Some("session.update") => {
                    send_json(&mut write, json!({"type": "session.updated", "session": event["session"]})).await?;
                }
                Some("input_audio_buffer.append") if !replied => {
                    replied = true;
                    send_reply(&mut write, *reply_ms).await?;
                    tokio::time::sleep(Duration::from_millis(*interrupt_after_ms)).await;
                    send_json(&mut write, json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 900, "item_id": "item_2"})).await?;
                }
                Some("response.cancel") => {
                    send_json(&mut write, json!({"type": "response.done", "response": {"id": MOCK_RESPONSE_ID, "status": "cancelled"}})).await?;
                    // audio generated before the cancel arrived
                    let stale = samples_to_pcm24_bytes(&generate_sine_wave(330.0, OUTPUT_SAMPLE_RATE, 2400, 0.3));
                    send_json(&mut write, json!({
                        "type": "response.audio.delta",
                        "response_id": MOCK_RESPONSE_ID,
                        "item_id": "item_reply",
                        "delta": encode_delta(&stale),
                        "format": "pcm24",
                    })).await?;
                }
                _ => {}
            },
        }
    }

    Ok(())
}

async fn send_json<S>(write: &mut S, value: Value) -> Result<(), BoxError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    write.send(Message::Text(value.to_string().into())).await?;
    Ok(())
}

/// `response.created` plus one PCM24 audio delta of `reply_ms`
async fn send_reply<S>(write: &mut S, reply_ms: u32) -> Result<(), BoxError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let samples = (OUTPUT_SAMPLE_RATE * reply_ms / 1000) as usize;
    let pcm = samples_to_pcm24_bytes(&generate_sine_wave(440.0, OUTPUT_SAMPLE_RATE, samples, 0.5));

    send_json(write, json!({"type": "response.created", "response": {"id": MOCK_RESPONSE_ID, "status": "in_progress"}})).await?;
    send_json(write, json!({
        "type": "response.audio.delta",
        "response_id": MOCK_RESPONSE_ID,
        "item_id": "item_reply",
        "delta": encode_delta(&pcm),
        "sample_rate_hz": OUTPUT_SAMPLE_RATE,
        "format": "pcm24",
    }))
    .await
}
