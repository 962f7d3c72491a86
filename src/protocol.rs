//! 双方向チャンネル上でやり取りするエンベロープ
//!
//! すべてのメッセージは `{"event": "<イベント名>", "data": <ペイロード>}` 形式の JSON。
//! 受信側は境界で一度だけパースし、既知のイベント以外は拒否する。

use crate::pcm;
use crate::types::{SampleI16, TurnState};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// クライアント → サーバー
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    /// base64 エンコードされたリトルエンディアン 16bit PCM (モノラル)
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend(String),

    /// 発話権の切り替え通知
    #[serde(rename = "current_speaker.switch")]
    CurrentSpeakerSwitch(TurnState),
}

impl OutboundEvent {
    /// PCM サンプルから `input_audio_buffer.append` を組み立てる
    pub fn audio_append(samples: &[SampleI16]) -> Self {
        Self::InputAudioBufferAppend(STANDARD.encode(pcm::to_le_bytes(samples)))
    }

    pub fn speaker_switch(turn: TurnState) -> Self {
        Self::CurrentSpeakerSwitch(turn)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("エンベロープのシリアライズに失敗")
    }

    /// ログ用のイベント名
    pub fn name(&self) -> &'static str {
        match self {
            Self::InputAudioBufferAppend(_) => "input_audio_buffer.append",
            Self::CurrentSpeakerSwitch(_) => "current_speaker.switch",
        }
    }
}

/// サーバー → クライアント
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    /// base64 エンコードされた自己記述型の音声チャンク (WAV)
    #[serde(rename = "output_audio_buffer.append")]
    OutputAudioBufferAppend(String),

    #[serde(rename = "user.speech_started")]
    UserSpeechStarted,

    #[serde(rename = "user.speech_stopped")]
    UserSpeechStopped,
}

impl InboundEvent {
    /// テキストフレームをパース
    ///
    /// # Errors
    ///
    /// JSON として不正、または未知のイベント名の場合にエラーを返す。
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .with_context(|| format!("不正なエンベロープ: {}", truncate_for_log(text)))
    }
}

/// `output_audio_buffer.append` のペイロードをバイト列に戻す
pub fn decode_audio_payload(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .context("音声ペイロードの base64 デコードに失敗")
}

fn truncate_for_log(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
