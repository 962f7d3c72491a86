use crate::types::TurnState;
use std::fmt;
use std::sync::{Arc, Mutex};

/// 接続状態（UI 表示用）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// 未接続
    Idle,
    /// 接続済み
    Connected,
    /// 録音中
    Recording,
    /// 録音停止
    Stopped,
    /// 切断
    Disconnected,
    /// 接続エラー
    ConnectionError,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "Idle",
            Self::Connected => "Connected",
            Self::Recording => "Recording",
            Self::Stopped => "Stopped",
            Self::Disconnected => "Disconnected",
            Self::ConnectionError => "Connection error",
        };
        f.write_str(text)
    }
}

/// 話者インジケータ（UI 表示用）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeakerIndicator {
    NotConnected,
    Ready,
    UserSpeaking,
    AiSpeaking,
}

impl fmt::Display for SpeakerIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotConnected => "Not connected",
            Self::Ready => "Ready for conversation",
            Self::UserSpeaking => "You are speaking",
            Self::AiSpeaking => "AI is speaking",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub speaker: SpeakerIndicator,
    pub recording: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            speaker: SpeakerIndicator::NotConnected,
            recording: false,
        }
    }
}

/// セッション全体で共有される表示状態
///
/// 描画は行わず、変化をログに出すだけ。
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn set_status(&self, status: SessionStatus) {
        if let Ok(mut s) = self.inner.lock() {
            if s.status != status {
                log::info!("状態: {}", status);
                s.status = status;
            }
        }
    }

    pub fn set_recording(&self, recording: bool) {
        if let Ok(mut s) = self.inner.lock() {
            s.recording = recording;
            if !recording {
                s.speaker = SpeakerIndicator::NotConnected;
            }
        }
    }

    /// 話者表示を更新
    ///
    /// `None` (または `TurnState::None`) の場合、録音中なら待機表示、そうでなければ未接続表示に戻す。
    pub fn set_speaker(&self, turn: Option<TurnState>) {
        if let Ok(mut s) = self.inner.lock() {
            let speaker = match turn {
                Some(TurnState::UserSpeaking) => SpeakerIndicator::UserSpeaking,
                Some(TurnState::AiSpeaking) => SpeakerIndicator::AiSpeaking,
                Some(TurnState::None) | None if s.recording => SpeakerIndicator::Ready,
                Some(TurnState::None) | None => SpeakerIndicator::NotConnected,
            };
            if s.speaker != speaker {
                log::debug!("話者表示: {}", speaker);
                s.speaker = speaker;
            }
        }
    }
}
