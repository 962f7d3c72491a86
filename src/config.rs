use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// 接続先サーバー設定
///
/// # デフォルト値
///
/// - `base_url`: "http://localhost:8000"
/// - `path`: "/ai-voice-chat"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_path")]
    pub path: String,
}

/// マイク入力設定
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `sample_rate`: 44100 Hz (サーバー側 TTS と同じレート)
/// - `frame_size`: 4096 サンプル
/// - `channels`: 1 (モノラル固定)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

/// 出力設定
///
/// # デフォルト値
///
/// - `device_id`: "default"
/// - `log_level`: "info"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// 割り込み後に完了したデコード結果の扱い
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleDecodePolicy {
    /// 破棄して再生しない
    Discard,

    /// そのまま予約する
    Schedule,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_stale_decode_policy")]
    pub stale_decode_policy: StaleDecodePolicy,
}

// Default functions
fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_path() -> String {
    "/ai-voice-chat".to_string()
}

fn default_device_id() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_frame_size() -> usize {
    4096
}

fn default_channels() -> u16 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stale_decode_policy() -> StaleDecodePolicy {
    StaleDecodePolicy::Discard
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            path: default_path(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sample_rate: default_sample_rate(),
            frame_size: default_frame_size(),
            channels: default_channels(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            log_level: default_log_level(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stale_decode_policy: default_stale_decode_policy(),
        }
    }
}

impl ServerConfig {
    /// ベースアドレスから WebSocket エンドポイントを導出
    ///
    /// スキームを `http` → `ws`、`https` → `wss` に書き換え、パスを連結する。
    ///
    /// # Errors
    ///
    /// ベースアドレスが空、URL として不正、または未対応のスキームの場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```
    /// # use voice_duplex::config::ServerConfig;
    /// let server = ServerConfig::default();
    /// let url = server.websocket_url().unwrap();
    /// assert_eq!(url.as_str(), "ws://localhost:8000/ai-voice-chat");
    /// ```
    pub fn websocket_url(&self) -> Result<Url> {
        let base = self.base_url.trim();
        if base.is_empty() {
            anyhow::bail!("Base URL を入力してください");
        }

        let mut url =
            Url::parse(base).with_context(|| format!("Base URL が不正です: {}", base))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => anyhow::bail!("未対応のスキームです: {}", other),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("スキームの書き換えに失敗: {}", base))?;

        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        url.set_path(&path);

        Ok(url)
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 接続前の入力検証
    ///
    /// 失敗した場合は接続を試みず、何も作成しない。
    pub fn validate(&self) -> Result<()> {
        self.server.websocket_url()?;

        if self.audio.channels != 1 {
            anyhow::bail!(
                "チャンネル数は 1 (モノラル) のみ対応しています: {}",
                self.audio.channels
            );
        }
        if self.audio.sample_rate == 0 {
            anyhow::bail!("サンプルレートが不正です: 0");
        }
        if self.audio.frame_size == 0 {
            anyhow::bail!("フレームサイズが不正です: 0");
        }

        Ok(())
    }
}
