use crate::types::AudioChunk;
use std::collections::VecDeque;

/// 再生待ちチャンクの FIFO キュー
///
/// 容量の上限はない。到着順に取り出され、並べ替えや優先度は持たない。
/// 受信順の連番もここで振る。
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    chunks: VecDeque<AudioChunk>,
    next_seq: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 受信したバイト列に連番を付けて末尾に追加
    pub fn push_bytes(&mut self, data: Vec<u8>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.chunks.push_back(AudioChunk { seq, data });
        seq
    }

    /// 先頭のチャンクを取り出す
    pub fn pop(&mut self) -> Option<AudioChunk> {
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// キュー内の合計バイト数
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    /// キューをクリア（セッション終了時）
    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
