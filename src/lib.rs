//! voice-duplex - 音声対話クライアントのオーディオエンジン
//!
//! マイク音声を PCM16 に変換してサーバーへ送り続けながら、
//! サーバーから届く音声チャンクを受信順に途切れなく再生します。
//!
//! # 主な機能
//!
//! - **キャプチャ**: 入力デバイスのフレームを PCM16 (リトルエンディアン) に変換して送信
//! - **ギャップレス再生**: チャンクを 1 つずつデコードし、前のチャンクの終了時刻に続けて予約
//! - **発話権の通知**: 再生状態に応じて `current_speaker.switch` を送信
//! - **割り込み (barge-in)**: ユーザーが話し始めたら再生中の音声を即座に止める
//!
//! # アーキテクチャ
//!
//! ```text
//! [Mic] → [AudioInput] → [CapturePipeline] ──────────────┐
//!                                                        ↓
//!                                                  [WsTransport] ⇄ Server
//!                                                        │
//!   ┌──────────────── Session (単一のイベントループ) ◀────┘
//!   │
//!   ├─▶ [PlaybackScheduler] ─▶ [ChunkDecoder] ─▶ [AudioOutput] → [Speaker]
//!   │           │
//!   └─▶ [TurnCoordinator] ─▶ current_speaker.switch
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use voice_duplex::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//! let url = config.server.websocket_url().unwrap();
//! println!("{}", url);
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio_input;
pub mod audio_output;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod pcm;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod transport;
pub mod turn;
pub mod types;

#[cfg(test)]
mod testing;
