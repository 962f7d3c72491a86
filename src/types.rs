use serde::{Deserialize, Serialize};

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// キャプチャデバイスから取り出した 1 フレーム分の浮動小数点サンプル (-1.0 ~ 1.0)
pub type CaptureFrame = Vec<f32>;

/// オーディオフォーマット情報
///
/// # Examples
///
/// ```
/// # use voice_duplex::types::AudioFormat;
/// let format = AudioFormat {
///     sample_rate: 44100,
///     channels: 1,
/// };
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// チャンネル数
    pub channels: u16,
}

/// サーバーから受信したエンコード済み音声チャンク
///
/// 受信順の連番が付与される。スケジューラが一度だけ消費し、作成後は変更しない。
#[derive(Clone, Debug)]
pub struct AudioChunk {
    /// 受信順の連番 (0 始まり)
    pub seq: u64,

    /// コンテナ形式 (WAV) の生バイト列
    pub data: Vec<u8>,
}

/// デコード済み音声
///
/// モノラルに変換済みの浮動小数点サンプルと、そのサンプリングレートを持つ。
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// 再生時間（秒）
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// 出力シンクに予約された音声ソースのハンドル
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

/// 発話権の状態
///
/// `current_speaker.switch` のペイロードとしてそのままシリアライズされる。
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum TurnState {
    /// 誰も話していない
    #[default]
    #[serde(rename = "none")]
    None,

    /// ローカルユーザーが発話中
    #[serde(rename = "user")]
    UserSpeaking,

    /// リモート (AI) の音声を再生中
    #[serde(rename = "ai")]
    AiSpeaking,
}

/// 出力シンクから届く再生イベント、およびデコードタスクの完了通知
#[derive(Debug)]
pub enum PlaybackEvent {
    /// デコード完了（成功・失敗どちらも）
    Decoded {
        ticket: crate::scheduler::DecodeTicket,
        result: anyhow::Result<DecodedAudio>,
    },

    /// ソースが自然に再生を終えた
    Ended(SourceHandle),
}
