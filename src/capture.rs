use crate::pcm;
use crate::protocol::OutboundEvent;
use crate::transport::Transport;

/// マイクフレームを PCM16 に変換してサーバーに送るパイプライン
///
/// チャンネルが開いていなければフレームはその場で捨てる。
/// バッファリングや再送はしない。
#[derive(Debug, Default)]
pub struct CapturePipeline {
    frames_sent: u64,
    frames_dropped: u64,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 1 フレームを処理
    ///
    /// # Returns
    /// * `true` - 送信キューに積んだ
    /// * `false` - 破棄した
    pub fn handle_frame(&mut self, frame: &[f32], transport: &dyn Transport) -> bool {
        if !transport.is_open() {
            self.frames_dropped += 1;
            return false;
        }

        let samples = pcm::encode_frame(frame);
        if transport.send_if_open(&OutboundEvent::audio_append(&samples)) {
            self.frames_sent += 1;
            true
        } else {
            self.frames_dropped += 1;
            false
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}
