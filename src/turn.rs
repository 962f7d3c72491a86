use crate::audio_output::AudioSink;
use crate::protocol::OutboundEvent;
use crate::scheduler::PlaybackScheduler;
use crate::transport::Transport;
use crate::types::{SourceHandle, TurnState};

/// 発話権の管理と割り込み (barge-in)
///
/// スケジューラは所有せず、割り込み時に借用して停止を指示する。
#[derive(Debug, Default)]
pub struct TurnCoordinator {
    turn: TurnState,
}

impl TurnCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(&self) -> TurnState {
        self.turn
    }

    /// チャンクを出力に予約した
    ///
    /// 予約のたびに "ai" を通知する。連続再生中は同じ通知が繰り返される。
    pub fn on_scheduled(&mut self, transport: &dyn Transport) {
        self.turn = TurnState::AiSpeaking;
        transport.send_if_open(&OutboundEvent::speaker_switch(TurnState::AiSpeaking));
    }

    /// 再生を終えてキューが空になった
    ///
    /// AI の発話中だった場合に限り "none" を一度だけ通知する。
    pub fn on_drained(&mut self, transport: &dyn Transport) {
        if self.turn != TurnState::AiSpeaking {
            return;
        }
        self.turn = TurnState::None;
        transport.send_if_open(&OutboundEvent::speaker_switch(TurnState::None));
    }

    /// ユーザーが話し始めた
    ///
    /// 再生中のソースを同じ処理ステップ内で停止し、"user" を通知する。
    pub fn barge_in(
        &mut self,
        scheduler: &mut PlaybackScheduler,
        sink: &mut dyn AudioSink,
        transport: &dyn Transport,
    ) -> Option<SourceHandle> {
        let stopped = scheduler.interrupt(sink);
        if let Some(handle) = stopped {
            log::info!("割り込み: ソース {:?} を停止", handle);
        } else {
            log::info!("割り込み: 再生中のソースなし");
        }

        self.turn = TurnState::UserSpeaking;
        transport.send_if_open(&OutboundEvent::speaker_switch(TurnState::UserSpeaking));
        stopped
    }

    /// ユーザーが話し終えた（表示状態のみ戻す）
    pub fn on_speech_stopped(&mut self) {
        if self.turn == TurnState::UserSpeaking {
            self.turn = TurnState::None;
        }
    }
}
