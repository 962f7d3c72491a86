use anyhow::{Context, Result};
use env_logger::Env;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use voice_duplex::audio_input::AudioInput;
use voice_duplex::audio_output::AudioOutput;
use voice_duplex::config::Config;
use voice_duplex::decoder::WavDecoder;
use voice_duplex::session::{Session, SessionEnd};
use voice_duplex::status::StatusBoard;
use voice_duplex::transport::WsTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        init_logger("info");
        AudioInput::list_devices()?;
        println!();
        AudioOutput::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // ロガーを初期化
    // 設定ファイルを読む前に初期化し、RUST_LOG がなければ後で設定のレベルに絞る
    init_logger("trace");

    let mut config = Config::load_or_default(config_path)?;

    if std::env::var_os("RUST_LOG").is_none() {
        match config.output.log_level.parse::<log::LevelFilter>() {
            Ok(level) => log::set_max_level(level),
            Err(_) => {
                log::set_max_level(log::LevelFilter::Info);
                log::warn!("不正なログレベルです: {}", config.output.log_level);
            }
        }
    }

    // --base-url で接続先を上書き
    if let Some(pos) = args.iter().position(|a| a == "--base-url") {
        let base_url = args
            .get(pos + 1)
            .context("--base-url には URL を指定してください")?;
        config.server.base_url = base_url.clone();
    }

    log::info!("voice-duplex を起動します");
    log::debug!("設定: {:?}", config);

    // 接続前に検証する。失敗時は何も作成しない
    config.validate()?;
    let url = config.server.websocket_url()?;

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    let (transport, reader, writer) = WsTransport::connect(&url).await?;

    // 出力は再生イベントの送信口を持つ
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let mut audio_output = AudioOutput::new(&config.output.device_id, playback_tx.clone())
        .context("出力デバイスの初期化に失敗")?;
    audio_output.start()?;

    let audio_input = AudioInput::new(&config.audio).context("入力デバイスの初期化に失敗")?;

    let status = StatusBoard::new();
    let session = Session::new(
        Box::new(transport),
        Box::new(audio_input),
        Box::new(audio_output),
        Arc::new(WavDecoder::new()),
        config.playback.stale_decode_policy,
        status.clone(),
        (playback_tx, playback_rx),
    );

    log::info!("会話を開始しました (Ctrl+C で停止)");

    let end = session.run(reader, running).await;

    // 書き込みタスクの完了を待つ
    let _ = writer.await;

    let snapshot = status.snapshot();
    match end {
        SessionEnd::ChannelError(e) => {
            log::error!("{} ({})", snapshot.status, e);
        }
        _ => log::info!("{}", snapshot.status),
    }

    log::info!("voice-duplex を終了しました");

    Ok(())
}

fn init_logger(level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}
