use crate::types::DecodedAudio;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Cursor;

/// 受信チャンクのデコーダ
///
/// デコードは中断 (await) し得る。結果はスケジューラに非同期で戻される。
#[async_trait]
pub trait ChunkDecoder: Send + Sync {
    async fn decode(&self, data: Vec<u8>) -> Result<DecodedAudio>;
}

/// WAV コンテナのデコーダ
///
/// 整数 PCM (8/16/24/32bit) と 32bit 浮動小数点に対応し、
/// 複数チャンネルは平均してモノラルにまとめる。
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

impl WavDecoder {
    pub fn new() -> Self {
        Self
    }

    /// 同期的にデコード
    pub fn decode_bytes(data: &[u8]) -> Result<DecodedAudio> {
        let mut reader =
            hound::WavReader::new(Cursor::new(data)).context("WAVヘッダの読み込みに失敗")?;
        let spec = reader.spec();

        if spec.channels == 0 {
            anyhow::bail!("チャンネル数 0 の WAV は再生できません");
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .context("WAVサンプルの読み込みに失敗")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .context("WAVサンプルの読み込みに失敗")?
            }
        };

        let channels = spec.channels as usize;
        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        Ok(DecodedAudio::new(samples, spec.sample_rate))
    }
}

#[async_trait]
impl ChunkDecoder for WavDecoder {
    async fn decode(&self, data: Vec<u8>) -> Result<DecodedAudio> {
        tokio::task::spawn_blocking(move || Self::decode_bytes(&data))
            .await
            .context("デコードタスクの実行に失敗")?
    }
}
