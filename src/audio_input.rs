use crate::config::AudioConfig;
use crate::types::{AudioFormat, CaptureFrame};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use tokio::sync::mpsc;

/// 固定長フレームを生成する音声入力
pub trait AudioSource {
    /// キャプチャを開始し、フレームを `frame_tx` に送る
    fn start(&mut self, frame_tx: mpsc::Sender<CaptureFrame>) -> Result<()>;

    /// キャプチャを停止してデバイスを解放
    fn stop(&mut self);

    fn format(&self) -> AudioFormat;
}

/// デバイスから届く任意長のバッファを固定長フレームに切り出す
pub struct FrameAccumulator {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// サンプルを追加し、揃ったフレームを取り出す
    pub fn push(&mut self, samples: &[f32]) -> Vec<CaptureFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// 未完成フレームのサンプル数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// マイクからのモノラル音声入力
pub struct AudioInput {
    device: cpal::Device,
    config: cpal::StreamConfig,
    stream: Option<cpal::Stream>,
    frame_size: usize,
}

impl AudioInput {
    /// 新しいAudioInputを作成
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        log::info!("入力設定: {:?}", config);

        let device = if config.device_id == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")?
        } else {
            host.input_devices()?
                .find(|d| d.name().ok().as_deref() == Some(config.device_id.as_str()))
                .with_context(|| format!("デバイスが見つかりません: {}", config.device_id))?
        };

        log::info!("入力デバイス: {:?}", device.name());

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_size as u32),
        };

        Ok(Self {
            device,
            config: stream_config,
            stream: None,
            frame_size: config.frame_size,
        })
    }

    /// ストリームを構築
    fn build_stream<T>(&self, frame_tx: mpsc::Sender<CaptureFrame>) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let num_channels = self.config.channels.max(1) as usize;
        let mut accumulator = FrameAccumulator::new(self.frame_size);

        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            // 先頭チャンネルのみ取り出す
            let mono: Vec<f32> = data
                .iter()
                .step_by(num_channels)
                .map(|&s| s.to_float_sample().into())
                .collect();

            for frame in accumulator.push(&mono) {
                match frame_tx.try_send(frame) {
                    Ok(_) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("キャプチャフレーム破棄: バッファ満杯");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::debug!("キャプチャフレーム破棄: チャンネルクローズ");
                    }
                }
            }
        };

        let error_callback = move |err| {
            log::error!("入力ストリームエラー: {}", err);
        };

        let stream = self
            .device
            .build_input_stream(&self.config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// 入力デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        let host = cpal::default_host();
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in host.input_devices()?.enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }
}

impl AudioSource for AudioInput {
    fn start(&mut self, frame_tx: mpsc::Sender<CaptureFrame>) -> Result<()> {
        let default_config = self
            .device
            .default_input_config()
            .context("デフォルト入力設定が取得できません")?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(frame_tx)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(frame_tx)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(frame_tx)?,
            cpal::SampleFormat::I32 => self.build_stream::<i32>(frame_tx)?,
            other => anyhow::bail!("サポートされていないサンプルフォーマット: {:?}", other),
        };

        stream.play().context("入力ストリームの開始に失敗")?;
        self.stream = Some(stream);

        log::info!(
            "音声入力ストリームを開始しました ({}Hz, {}サンプル/フレーム)",
            self.config.sample_rate.0,
            self.frame_size
        );

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声入力ストリームを停止しました");
        }
    }

    fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.config.sample_rate.0,
            channels: self.config.channels,
        }
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        self.stop();
    }
}
