//! 受信チャンクの再生スケジューラ
//!
//! # 状態遷移
//!
//! ```text
//!            enqueue (Idle)                 decoded
//!   Idle ───────────────────▶ Decoding ───────────────▶ Playing
//!    ▲                           │ decode error / stale     │
//!    │◀──────────────────────────┘                          │
//!    │◀─────────────── ended (queue empty → Drained) ───────┘
//!    │                            ended (queue non-empty) → Decoding
//!    └── interrupt: Playing のソースを即停止して Idle へ
//! ```
//!
//! 割り込みフラグは状態と直交するゲートで、立っている間は再生終了後の自動継続を止める。
//! 割り込み後に新しいチャンクが届くとゲートを下ろす。Idle ならその場で再開し、
//! 割り込み前のデコードが残っていればその結果を処理した後に再開する。
//!
//! スケジューラ自身はデコードを実行しない。`DecodeRequested` を返し、
//! 呼び出し側がデコードして `on_decoded` に結果を戻す。

use crate::audio_output::AudioSink;
use crate::config::StaleDecodePolicy;
use crate::queue::PlaybackQueue;
use crate::types::{AudioChunk, DecodedAudio, SourceHandle};
use anyhow::Result;

/// デコード要求の識別子
///
/// 割り込みのたびに世代 (`epoch`) が進み、古い世代の結果を見分けられる。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeTicket {
    pub seq: u64,
    epoch: u64,
}

#[derive(Debug)]
pub struct DecodeRequest {
    pub ticket: DecodeTicket,
    pub chunk: AudioChunk,
}

/// 出力に予約済みのソース
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveSource {
    pub handle: SourceHandle,
    pub seq: u64,
    /// 出力クロック上の開始時刻（秒）
    pub start_at: f64,
    /// 再生時間（秒）
    pub duration: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlaybackState {
    /// 何も予約・デコードしていない（キューは空とは限らない）
    Idle,

    /// 先頭チャンクをデコード中
    Decoding(DecodeTicket),

    /// 1 つのソースを予約済み
    Playing(ActiveSource),
}

/// スケジューラから呼び出し側への通知
#[derive(Debug)]
pub enum SchedulerNotice {
    /// このチャンクをデコードして `on_decoded` に戻すこと
    DecodeRequested(DecodeRequest),

    /// ソースを出力に予約した
    Scheduled(ActiveSource),

    /// 再生を終えてキューが空になった
    Drained,
}

pub struct PlaybackScheduler {
    queue: PlaybackQueue,
    state: PlaybackState,
    interrupted: bool,
    next_play_time: f64,
    epoch: u64,
    stale_decode_policy: StaleDecodePolicy,
}

impl PlaybackScheduler {
    pub fn new(stale_decode_policy: StaleDecodePolicy) -> Self {
        Self {
            queue: PlaybackQueue::new(),
            state: PlaybackState::Idle,
            interrupted: false,
            next_play_time: 0.0,
            epoch: 0,
            stale_decode_policy,
        }
    }

    /// 受信チャンクをキューに追加し、Idle なら再生を開始する
    pub fn enqueue(&mut self, data: Vec<u8>) -> Vec<SchedulerNotice> {
        let seq = self.queue.push_bytes(data);
        log::debug!(
            "チャンク #{} をキューに追加 (待ち {} 件, {} バイト)",
            seq,
            self.queue.len(),
            self.queue.total_bytes()
        );

        match self.state {
            PlaybackState::Idle => {
                self.interrupted = false;
                self.try_start()
            }
            // 割り込み前のデコードが終わるのを待つ。結果を処理した後にこのチャンクから再開する
            PlaybackState::Decoding(ticket) if ticket.epoch != self.epoch => {
                self.interrupted = false;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// デコード結果を受け取り、出力に予約する
    pub fn on_decoded(
        &mut self,
        ticket: DecodeTicket,
        result: Result<DecodedAudio>,
        sink: &mut dyn AudioSink,
    ) -> Vec<SchedulerNotice> {
        match self.state {
            PlaybackState::Decoding(current) if current == ticket => {}
            _ => {
                log::debug!("想定外のデコード結果を無視: {:?}", ticket);
                return Vec::new();
            }
        }

        let stale = ticket.epoch != self.epoch;

        match result {
            Ok(_) if stale && self.stale_decode_policy == StaleDecodePolicy::Discard => {
                log::info!("割り込み後に完了したチャンク #{} を破棄", ticket.seq);
                self.state = PlaybackState::Idle;
                self.after_chunk()
            }
            Ok(audio) => {
                if stale {
                    log::info!("割り込み後に完了したチャンク #{} をそのまま予約", ticket.seq);
                }
                let active = self.schedule(ticket.seq, audio, sink);
                vec![SchedulerNotice::Scheduled(active)]
            }
            Err(e) => {
                log::warn!("チャンク #{} のデコードに失敗、スキップします: {:#}", ticket.seq, e);
                self.state = PlaybackState::Idle;
                self.after_chunk()
            }
        }
    }

    /// ソースの自然終了
    ///
    /// 停止済みのソースなど、現在のソース以外の通知は無視する。
    pub fn on_source_ended(&mut self, handle: SourceHandle) -> Vec<SchedulerNotice> {
        match self.state {
            PlaybackState::Playing(active) if active.handle == handle => {
                log::debug!("チャンク #{} の再生終了", active.seq);
                self.state = PlaybackState::Idle;
                self.after_chunk()
            }
            _ => Vec::new(),
        }
    }

    /// 再生を即座に打ち切る
    ///
    /// 割り込みフラグを立て、予約中のソースがあれば停止する。キューはクリアしない。
    /// デコード中のチャンクは古い世代として扱われる。
    pub fn interrupt(&mut self, sink: &mut dyn AudioSink) -> Option<SourceHandle> {
        self.interrupted = true;
        self.epoch += 1;
        self.next_play_time = sink.current_time();

        match self.state {
            PlaybackState::Playing(active) => {
                sink.stop(active.handle);
                self.state = PlaybackState::Idle;
                log::debug!("チャンク #{} を割り込みで停止", active.seq);
                Some(active.handle)
            }
            _ => None,
        }
    }

    /// セッション終了時に全てを破棄
    pub fn shutdown(&mut self, sink: &mut dyn AudioSink) {
        if let PlaybackState::Playing(active) = self.state {
            sink.stop(active.handle);
        }
        self.state = PlaybackState::Idle;
        self.interrupted = true;
        self.epoch += 1;
        self.queue.clear();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn is_idle(&self) -> bool {
        self.state == PlaybackState::Idle
    }

    /// 次のチャンクの開始予定時刻（秒）
    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn try_start(&mut self) -> Vec<SchedulerNotice> {
        if self.state != PlaybackState::Idle {
            return Vec::new();
        }

        match self.queue.pop() {
            Some(chunk) => {
                let ticket = DecodeTicket {
                    seq: chunk.seq,
                    epoch: self.epoch,
                };
                self.state = PlaybackState::Decoding(ticket);
                vec![SchedulerNotice::DecodeRequested(DecodeRequest { ticket, chunk })]
            }
            None => Vec::new(),
        }
    }

    /// 1 チャンクの処理が終わった後（再生終了・デコード失敗・破棄）
    fn after_chunk(&mut self) -> Vec<SchedulerNotice> {
        if self.interrupted {
            return Vec::new();
        }
        if self.queue.is_empty() {
            vec![SchedulerNotice::Drained]
        } else {
            self.try_start()
        }
    }

    /// `max(現在時刻, next_play_time)` から再生を予約し、`next_play_time` を進める
    fn schedule(&mut self, seq: u64, audio: DecodedAudio, sink: &mut dyn AudioSink) -> ActiveSource {
        if let PlaybackState::Playing(previous) = self.state {
            sink.stop(previous.handle);
        }

        let start_at = sink.current_time().max(self.next_play_time);
        let duration = audio.duration_secs();
        let handle = sink.schedule(audio, start_at);
        self.next_play_time = start_at + duration;

        let active = ActiveSource {
            handle,
            seq,
            start_at,
            duration,
        };
        self.state = PlaybackState::Playing(active);

        log::debug!(
            "チャンク #{} を予約: start={:.3}s, duration={:.3}s",
            seq,
            start_at,
            duration
        );

        active
    }
}
