//! Common utilities for integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use narration_core::{
    wav, AudioBuffer, AudioFormat, BgmAsset, InMemoryBgmLibrary, Pipeline, PipelineConfig, RawAudio,
    SilentSynthesizer, SpeechSynthesizer,
};
use server::config::ServerConfig;
use server::{build_app, AppState};

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    /// Holds the output directory alive for the test.
    pub output: TempDir,
}

fn bgm_library() -> InMemoryBgmLibrary {
    let format = AudioFormat::default();
    let mut bed = AudioBuffer::silence_ms(format, 2_000);
    bed.samples.iter_mut().for_each(|s| *s = 0.3);
    let bytes = wav::encode_wav(&bed).unwrap();
    let asset = BgmAsset {
        id: "soft-rain".to_string(),
        emotion_tags: BTreeSet::from(["anxiety".to_string(), "healing".to_string()]),
        duration_ms: 2_000,
        loop_point_ms: 500,
        source: "soft-rain.wav".to_string(),
    };
    InMemoryBgmLibrary::new().with_asset(asset, RawAudio::wav(bytes))
}

/// Quick offline synthesizer: 10 ms of quiet tone per character.
pub fn quick_synth() -> Arc<dyn SpeechSynthesizer> {
    Arc::new(SilentSynthesizer {
        ms_per_char: 10,
        amplitude: 0.1,
        ..SilentSynthesizer::default()
    })
}

/// Create a test app instance
pub fn create_test_app() -> TestApp {
    create_test_app_with(quick_synth())
}

pub fn create_test_app_with(synthesizer: Arc<dyn SpeechSynthesizer>) -> TestApp {
    let output = tempfile::tempdir().unwrap();
    let pipeline_config = PipelineConfig {
        output_dir: Some(output.path().to_path_buf()),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(synthesizer, Arc::new(bgm_library()), pipeline_config).unwrap();

    let config = ServerConfig {
        rate_limit_per_minute: 6_000,
        output_dir: output.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let state = AppState::new(pipeline, config);
    let router = build_app(state.clone()).unwrap();
    TestApp { router, state, output }
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = self
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.get(uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    pub async fn delete_json(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    /// Poll the job status until it carries an outcome.
    pub async fn wait_for_outcome(&self, job_id: &str) -> Value {
        for _ in 0..500 {
            let (status, body) = self.get_json(&format!("/narrations/{job_id}")).await;
            assert_eq!(status, StatusCode::OK);
            if !body["outcome"].is_null() {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }
}
