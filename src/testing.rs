//! テスト用のフェイク実装（クロック・出力・チャンネル・デコーダ・入力）

use crate::audio_input::AudioSource;
use crate::audio_output::AudioSink;
use crate::decoder::ChunkDecoder;
use crate::protocol::OutboundEvent;
use crate::transport::Transport;
use crate::types::{AudioFormat, CaptureFrame, DecodedAudio, SourceHandle};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct FakeSinkState {
    now: f64,
    next_handle: u64,
    scheduled: Vec<(SourceHandle, f64, f64)>,
    active: Vec<SourceHandle>,
    stopped: Vec<SourceHandle>,
}

/// 手動で進めるクロックを持つ出力
///
/// クローンは同じ状態を共有する。
#[derive(Clone, Debug, Default)]
pub struct FakeSink {
    state: Arc<Mutex<FakeSinkState>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    /// (handle, start_at, duration)
    pub fn scheduled(&self) -> Vec<(SourceHandle, f64, f64)> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn active(&self) -> Vec<SourceHandle> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn stopped(&self) -> Vec<SourceHandle> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// ソースが自然に再生を終えたことにする
    pub fn finish(&self, handle: SourceHandle) {
        self.state.lock().unwrap().active.retain(|&h| h != handle);
    }
}

impl AudioSink for FakeSink {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn schedule(&mut self, audio: DecodedAudio, start_at: f64) -> SourceHandle {
        let mut state = self.state.lock().unwrap();
        let handle = SourceHandle(state.next_handle);
        state.next_handle += 1;
        state.scheduled.push((handle, start_at, audio.duration_secs()));
        state.active.push(handle);
        handle
    }

    fn stop(&mut self, handle: SourceHandle) {
        let mut state = self.state.lock().unwrap();
        if state.active.contains(&handle) {
            state.active.retain(|&h| h != handle);
            state.stopped.push(handle);
        }
    }

    fn stop_all(&mut self) {
        let mut state = self.state.lock().unwrap();
        let active = std::mem::take(&mut state.active);
        state.stopped.extend(active);
    }
}

/// 送信内容を記録するチャンネル
#[derive(Clone, Debug)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutboundEvent>>>,
    open: Arc<Mutex<bool>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(Mutex::new(true)),
        }
    }

    pub fn set_open(&self, open: bool) {
        *self.open.lock().unwrap() = open;
    }

    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    fn send(&self, event: &OutboundEvent) -> Result<()> {
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn close(&self) {
        self.set_open(false);
    }
}

/// ペイロード先頭バイトを 1/10 秒単位の長さとして解釈するデコーダ
///
/// 空のペイロードはデコード失敗になる。
#[derive(Debug, Default)]
pub struct FakeDecoder;

pub const FAKE_RATE: u32 = 1000;

/// `tenths` / 10 秒のチャンクを表すペイロード
pub fn fake_payload(tenths: u8) -> Vec<u8> {
    vec![tenths]
}

#[async_trait]
impl ChunkDecoder for FakeDecoder {
    async fn decode(&self, data: Vec<u8>) -> Result<DecodedAudio> {
        match data.first() {
            Some(&tenths) => Ok(DecodedAudio::new(
                vec![0.0; tenths as usize * (FAKE_RATE as usize / 10)],
                FAKE_RATE,
            )),
            None => anyhow::bail!("empty payload"),
        }
    }
}

#[derive(Debug, Default)]
struct FakeSourceState {
    started: bool,
    stopped: bool,
    frame_tx: Option<mpsc::Sender<CaptureFrame>>,
}

/// 入力デバイスの代わり
#[derive(Clone, Debug, Default)]
pub struct FakeSource {
    state: Arc<Mutex<FakeSourceState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// 開始時に渡された送信口
    pub fn frame_tx(&self) -> Option<mpsc::Sender<CaptureFrame>> {
        self.state.lock().unwrap().frame_tx.clone()
    }
}

impl AudioSource for FakeSource {
    fn start(&mut self, frame_tx: mpsc::Sender<CaptureFrame>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.started = true;
        state.frame_tx = Some(frame_tx);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.frame_tx = None;
    }

    fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: 44100,
            channels: 1,
        }
    }
}
