use crate::types::{DecodedAudio, PlaybackEvent, SourceHandle};
use anyhow::{Context, Result};
use audioadapter_buffers::direct::SequentialSliceOfVecs;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use rubato::{Fft, FixedSync, Resampler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// デコード済み音声を出力クロック上の指定時刻に再生する出力先
///
/// 自然に再生を終えたソースは `PlaybackEvent::Ended` で通知する。
/// `stop` したソースについては通知しない。
pub trait AudioSink {
    /// 出力クロックの現在時刻（秒）
    fn current_time(&self) -> f64;

    /// `start_at` 秒から再生するよう予約
    fn schedule(&mut self, audio: DecodedAudio, start_at: f64) -> SourceHandle;

    /// ソースを即座に停止
    fn stop(&mut self, handle: SourceHandle);

    /// 予約済みの全ソースを停止
    fn stop_all(&mut self);
}

/// 出力クロック上に配置された音声ソース
#[derive(Debug)]
struct ScheduledSource {
    handle: SourceHandle,
    start_frame: u64,
    samples: Vec<f32>,
    /// 1 サンプルでも出力したか
    started: bool,
}

impl ScheduledSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// 予約済みソースのミキサ
#[derive(Debug, Default)]
struct Mixer {
    sources: Vec<ScheduledSource>,
}

impl Mixer {
    /// `clock` フレーム目から `out.len()` フレーム分を書き込み、再生を終えたソースを返す
    ///
    /// 開始時刻を過ぎてから届いたソースは先頭を欠かさず `clock` から再生する。
    fn render(&mut self, clock: u64, out: &mut [f32]) -> Vec<SourceHandle> {
        out.iter_mut().for_each(|s| *s = 0.0);
        let block_end = clock + out.len() as u64;

        for source in &mut self.sources {
            if !source.started && source.start_frame < clock {
                source.start_frame = clock;
            }

            let from = source.start_frame.max(clock);
            let to = source.end_frame().min(block_end);
            for frame in from..to {
                out[(frame - clock) as usize] += source.samples[(frame - source.start_frame) as usize];
            }
            if from < to {
                source.started = true;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        let mut finished = Vec::new();
        self.sources.retain(|source| {
            if source.end_frame() <= block_end {
                finished.push(source.handle);
                false
            } else {
                true
            }
        });
        finished
    }

    fn remove(&mut self, handle: SourceHandle) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.handle != handle);
        before != self.sources.len()
    }
}

/// リサンプラの 1 回あたりの入力フレーム数
const RESAMPLE_CHUNK: usize = 1024;

/// モノラル
const MONO: usize = 1;

/// チャンク全体のサンプリングレートを変換
///
/// 出力長は `samples.len() * to_rate / from_rate` に揃え、リサンプラの遅延分は先頭から取り除く。
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = Fft::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        1,
        MONO,
        FixedSync::Input,
    )
    .map_err(|e| anyhow::anyhow!("リサンプラの作成に失敗 ({}Hz → {}Hz): {}", from_rate, to_rate, e))?;

    let expected = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let delay = resampler.output_delay();

    let mut work_in = vec![vec![0.0; resampler.input_frames_max()]];
    let mut work_out = vec![vec![0.0; resampler.output_frames_max()]];
    let mut output = Vec::with_capacity(expected + delay + resampler.output_frames_max());
    let mut pos = 0;

    // 入力を使い切った後は無音を流して遅延分を吐き出させる
    while output.len() < expected + delay {
        let frames_needed = resampler.input_frames_next();
        let available = samples.len().saturating_sub(pos).min(frames_needed);
        work_in[0][..available].copy_from_slice(&samples[pos..pos + available]);
        work_in[0][available..frames_needed].fill(0.0);
        pos += available;

        let input_adapter = SequentialSliceOfVecs::new(&work_in[..], MONO, frames_needed)
            .map_err(|e| anyhow::anyhow!("入力アダプタのエラー: {}", e))?;

        let output_frames = resampler.output_frames_next();
        let mut output_adapter =
            SequentialSliceOfVecs::new_mut(&mut work_out[..], MONO, output_frames)
                .map_err(|e| anyhow::anyhow!("出力アダプタのエラー: {}", e))?;

        let (_, frames_written) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, None)
            .map_err(|e| anyhow::anyhow!("リサンプルに失敗: {}", e))?;

        if frames_written == 0 && pos >= samples.len() {
            break;
        }
        output.extend_from_slice(&work_out[0][..frames_written]);
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

/// 音声出力デバイス
///
/// 出力ストリームのコールバックが進めたフレーム数を出力クロックとして使う。
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    mixer: Arc<Mutex<Mixer>>,
    frames_played: Arc<AtomicU64>,
    next_handle: u64,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl AudioOutput {
    /// 新しいAudioOutputを作成
    pub fn new(device_id: &str, event_tx: mpsc::UnboundedSender<PlaybackEvent>) -> Result<Self> {
        let host = cpal::default_host();

        let device = if device_id == "default" {
            host.default_output_device()
                .ok_or_else(|| anyhow::anyhow!("デフォルト出力デバイスが見つかりません"))?
        } else {
            host.output_devices()?
                .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
                .ok_or_else(|| anyhow::anyhow!("出力デバイス '{}' が見つかりません", device_id))?
        };

        log::info!("出力デバイス: {}", device.name()?);

        let default_config = device
            .default_output_config()
            .context("デフォルト出力設定が取得できません")?;

        log::info!(
            "出力デバイス設定: {:?}, {}Hz, {}ch",
            default_config.sample_format(),
            default_config.sample_rate().0,
            default_config.channels()
        );

        Ok(Self {
            device,
            sample_format: default_config.sample_format(),
            config: default_config.config(),
            stream: None,
            mixer: Arc::new(Mutex::new(Mixer::default())),
            frames_played: Arc::new(AtomicU64::new(0)),
            next_handle: 0,
            event_tx,
        })
    }

    /// 出力デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        let host = cpal::default_host();
        println!("=== 利用可能な出力デバイス ===");

        for (idx, device) in host.output_devices()?.enumerate() {
            let name = device.name()?;
            let is_default = host
                .default_output_device()
                .and_then(|d| d.name().ok())
                .map(|default_name| default_name == name)
                .unwrap_or(false);

            let marker = if is_default { " (デフォルト)" } else { "" };
            println!("{}. {}{}", idx, name, marker);

            if let Ok(config) = device.default_output_config() {
                println!(
                    "   サンプルレート: {} Hz, チャンネル数: {}",
                    config.sample_rate().0,
                    config.channels()
                );
            }
        }

        Ok(())
    }

    /// 出力ストリームを開始
    pub fn start(&mut self) -> Result<()> {
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream::<f32>()?,
            SampleFormat::I16 => self.build_stream::<i16>()?,
            SampleFormat::U16 => self.build_stream::<u16>()?,
            other => anyhow::bail!("サポートされていないサンプルフォーマット: {:?}", other),
        };

        stream.play().context("出力ストリームの再生開始に失敗")?;
        self.stream = Some(stream);

        log::info!(
            "出力ストリーム開始: サンプルレート={}Hz, チャンネル={}",
            self.config.sample_rate.0,
            self.config.channels
        );

        Ok(())
    }

    /// 指定されたサンプルフォーマットで出力ストリームを構築
    fn build_stream<T>(&self) -> Result<Stream>
    where
        T: SizedSample + Sample + FromSample<f32> + Send + 'static,
    {
        let channels = self.config.channels.max(1) as usize;
        let mixer = self.mixer.clone();
        let frames_played = self.frames_played.clone();
        let event_tx = self.event_tx.clone();
        let mut mono: Vec<f32> = Vec::new();

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    mono.resize(frames, 0.0);

                    let clock = frames_played.load(Ordering::Acquire);
                    let finished = match mixer.lock() {
                        Ok(mut mixer) => mixer.render(clock, &mut mono),
                        Err(_) => {
                            mono.iter_mut().for_each(|s| *s = 0.0);
                            Vec::new()
                        }
                    };

                    for (frame, &value) in data.chunks_mut(channels).zip(mono.iter()) {
                        for sample in frame.iter_mut() {
                            *sample = T::from_sample(value);
                        }
                    }
                    frames_played.fetch_add(frames as u64, Ordering::Release);

                    for handle in finished {
                        let _ = event_tx.send(PlaybackEvent::Ended(handle));
                    }
                },
                move |err| {
                    log::error!("出力ストリームエラー: {}", err);
                },
                None,
            )
            .context("出力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// 出力ストリームを停止
    pub fn stop(&mut self) {
        self.stop_all();
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("出力ストリームを停止しました");
        }
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

impl AudioSink for AudioOutput {
    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / self.sample_rate() as f64
    }

    fn schedule(&mut self, audio: DecodedAudio, start_at: f64) -> SourceHandle {
        let handle = SourceHandle(self.next_handle);
        self.next_handle += 1;

        let rate = self.sample_rate();
        let samples = match resample(&audio.samples, audio.sample_rate, rate) {
            Ok(samples) => samples,
            Err(e) => {
                // 空のソースとして予約し、すぐに終了させて次のチャンクに進む
                log::warn!("ソース {:?} を再生できません: {:#}", handle, e);
                Vec::new()
            }
        };
        let start_frame = (start_at.max(0.0) * rate as f64).round() as u64;

        match self.mixer.lock() {
            Ok(mut mixer) => mixer.sources.push(ScheduledSource {
                handle,
                start_frame,
                samples,
                started: false,
            }),
            Err(_) => log::error!("ミキサのロックに失敗: ソース {:?} を予約できません", handle),
        }

        handle
    }

    fn stop(&mut self, handle: SourceHandle) {
        if let Ok(mut mixer) = self.mixer.lock() {
            if mixer.remove(handle) {
                log::debug!("ソース {:?} を停止", handle);
            }
        }
    }

    fn stop_all(&mut self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.sources.clear();
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
