// Live narration streaming over WebSocket
//
// Protocol: the client sends one text frame holding a narration request,
// then receives a `status` frame, one `chunk` frame per segment in index
// order and a final `complete` frame. Failures are reported as `error`
// frames.

use std::sync::Arc;

use futures_util::sink::SinkExt;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use narration_core::{wav, ChannelSink, JobRequest, StreamChunk};

use crate::error::ApiError;
use crate::jobs::outcome_message;
use crate::validation::{validate_narration_request, NarrationRequest};
use crate::{audio_url, AppState};

pub async fn stream_narration(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_stream(socket, state))
}

async fn run_stream(mut socket: WebSocket, state: AppState) {
    state
        .request_count
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let req = match tokio::time::timeout(state.config.ws_request_timeout(), read_request(&mut socket)).await {
        Ok(Some(Ok(req))) => req,
        Ok(Some(Err(e))) => {
            send_error(&mut socket, &e).await;
            return;
        }
        // client went away before asking for anything
        Ok(None) => return,
        Err(_) => {
            let e = ApiError::InvalidInput("Timed out waiting for the narration request".to_string());
            send_error(&mut socket, &e).await;
            return;
        }
    };

    let plan = match validate_narration_request(&req) {
        Ok(plan) => plan,
        Err(e) => {
            send_error(&mut socket, &e).await;
            return;
        }
    };

    let total_segments = plan.len();
    let (sink, mut chunks) = ChannelSink::new(state.pipeline.config().live_buffer);
    let handle = state
        .pipeline
        .start(JobRequest::new(plan, req.emotion.clone()), sink);
    let job_id = handle.job_id();
    let finished = state
        .registry
        .track(handle, req.emotion.clone(), total_segments, Arc::clone(&state.metrics));
    info!(%job_id, total_segments, emotion = %req.emotion, "Live narration started");

    let status = json!({
        "type": "status",
        "status": "synthesizing",
        "job_id": job_id,
        "total_segments": total_segments,
    });
    if socket.send(Message::Text(status.to_string().into())).await.is_err() {
        // dropping the receiver detaches the live consumer; the job keeps persisting
        warn!(%job_id, "Client left before streaming started");
        return;
    }

    while let Some(chunk) = chunks.recv().await {
        let frame = match chunk_frame(&chunk) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%job_id, index = chunk.segment_index, error = %e, "Failed to encode chunk");
                let e = ApiError::InternalError(format!("Failed to encode segment {}", chunk.segment_index));
                send_error(&mut socket, &e).await;
                return;
            }
        };
        if let Err(e) = socket.send(Message::Text(frame.to_string().into())).await {
            warn!(%job_id, index = chunk.segment_index, "Failed to send WS message: {e}");
            return;
        }
        debug!(%job_id, index = chunk.segment_index, "Chunk sent");
    }
    drop(chunks);

    let outcome = finished.await.ok().and_then(|status| status.outcome);
    let frame = match outcome {
        Some(outcome) => json!({
            "type": "complete",
            "job_id": job_id,
            "state": outcome.state(),
            "message": outcome_message(&outcome),
            "outcome": outcome,
            "audio_url": audio_url(job_id),
        }),
        None => json!({
            "type": "complete",
            "job_id": job_id,
            "audio_url": audio_url(job_id),
        }),
    };
    let _ = socket.send(Message::Text(frame.to_string().into())).await;
    let _ = socket.close().await;
}

/// Wait for the first text frame and parse it as a narration request.
async fn read_request(socket: &mut WebSocket) -> Option<Result<NarrationRequest, ApiError>> {
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => {
                return Some(
                    serde_json::from_str(text.as_str())
                        .map_err(|e| ApiError::InvalidInput(format!("Malformed narration request: {e}"))),
                );
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_error(socket: &mut WebSocket, error: &ApiError) {
    let code = match error {
        ApiError::InvalidInput(_) => 400,
        ApiError::NotFound(_) => 404,
        ApiError::NotReady(_) | ApiError::Conflict(_) => 409,
        ApiError::RateLimitExceeded => 429,
        ApiError::Pipeline(_) | ApiError::InternalError(_) => 500,
    };
    let msg = json!({ "type": "error", "error": error.to_string(), "code": code });
    let _ = socket.send(Message::Text(msg.to_string().into())).await;
    let _ = socket.close().await;
}

/// JSON frame for one chunk, audio as a base64 WAV.
pub fn chunk_frame(chunk: &StreamChunk) -> Result<Value, String> {
    let audio_base64 = wav::encode_wav_base64(&chunk.audio).map_err(|e| e.to_string())?;
    Ok(json!({
        "type": "chunk",
        "index": chunk.segment_index,
        "has_bgm": chunk.has_bgm,
        "is_final": chunk.is_final,
        "duration_ms": chunk.duration_ms(),
        "sample_rate": chunk.audio.format.sample_rate,
        "audio_base64": audio_base64,
    }))
}
