use crate::audio_input::AudioSource;
use crate::audio_output::AudioSink;
use crate::capture::CapturePipeline;
use crate::config::StaleDecodePolicy;
use crate::decoder::ChunkDecoder;
use crate::protocol::{self, InboundEvent};
use crate::scheduler::{PlaybackScheduler, SchedulerNotice};
use crate::status::{SessionStatus, StatusBoard};
use crate::transport::Transport;
use crate::types::{CaptureFrame, PlaybackEvent, TurnState};
use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::Message};

/// キャプチャフレームのキュー長
const FRAME_QUEUE_CAPACITY: usize = 64;

/// セッションの終了理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// 停止要求 (Ctrl+C)
    Stopped,
    /// サーバーがチャンネルを閉じた
    ChannelClosed,
    /// チャンネルのエラー
    ChannelError(String),
}

/// 1 つの会話セッション
///
/// チャンネル・入力・出力・キュー・スケジューラを占有する。
/// すべての状態は単一のイベントループからのみ変更される。
pub struct Session {
    transport: Box<dyn Transport>,
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    decoder: Arc<dyn ChunkDecoder>,
    scheduler: PlaybackScheduler,
    turn: crate::turn::TurnCoordinator,
    capture: CapturePipeline,
    status: StatusBoard,
    playback_tx: mpsc::UnboundedSender<PlaybackEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl Session {
    /// `playback` は出力シンクと共有する再生イベントのチャンネル
    pub fn new(
        transport: Box<dyn Transport>,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        decoder: Arc<dyn ChunkDecoder>,
        stale_decode_policy: StaleDecodePolicy,
        status: StatusBoard,
        playback: (
            mpsc::UnboundedSender<PlaybackEvent>,
            mpsc::UnboundedReceiver<PlaybackEvent>,
        ),
    ) -> Self {
        let (playback_tx, playback_rx) = playback;
        Self {
            transport,
            source,
            sink,
            decoder,
            scheduler: PlaybackScheduler::new(stale_decode_policy),
            turn: crate::turn::TurnCoordinator::new(),
            capture: CapturePipeline::new(),
            status,
            playback_tx,
            playback_rx,
        }
    }

    /// 録音を開始
    pub fn start_recording(&mut self) -> Result<mpsc::Receiver<CaptureFrame>> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        self.source
            .start(frame_tx)
            .context("録音の開始に失敗")?;

        let format = self.source.format();
        log::info!(
            "録音開始: {}Hz, {}ch",
            format.sample_rate,
            format.channels
        );

        self.status.set_recording(true);
        self.status.set_status(SessionStatus::Recording);
        self.status.set_speaker(None);
        Ok(frame_rx)
    }

    /// イベントループ
    ///
    /// チャンネルが閉じるか `running` が false になるまで、
    /// マイクフレーム・受信メッセージ・再生イベントを 1 つずつ処理する。
    pub async fn run<R>(mut self, mut reader: R, running: Arc<AtomicBool>) -> SessionEnd
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        self.status.set_status(SessionStatus::Connected);

        let mut frames = match self.start_recording() {
            Ok(rx) => Some(rx),
            Err(e) => {
                log::error!("{:#}", e);
                None
            }
        };

        let mut stop_check = tokio::time::interval(tokio::time::Duration::from_millis(100));

        let end = loop {
            if !running.load(Ordering::SeqCst) {
                break SessionEnd::Stopped;
            }

            tokio::select! {
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        log::warn!("想定外のバイナリメッセージを破棄: {} バイト", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("サーバーが接続を閉じました: {:?}", frame);
                        break SessionEnd::ChannelClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket エラー: {}", e);
                        break SessionEnd::ChannelError(e.to_string());
                    }
                    None => {
                        log::info!("WebSocket ストリームが終了しました");
                        break SessionEnd::ChannelClosed;
                    }
                },
                Some(frame) = recv_frame(&mut frames) => self.handle_frame(&frame),
                Some(event) = self.playback_rx.recv() => self.handle_playback_event(event),
                // 他のイベントが途切れなくても停止要求を確認する
                _ = stop_check.tick() => {}
            }
        };

        self.teardown(&end);
        end
    }

    /// マイクフレームを送信
    pub fn handle_frame(&mut self, frame: &[f32]) {
        self.capture.handle_frame(frame, self.transport.as_ref());
    }

    /// 受信テキストをパースして振り分ける
    ///
    /// 不正なエンベロープはログに残して捨てる。
    pub fn handle_text(&mut self, text: &str) {
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("{:#}", e);
                return;
            }
        };

        match event {
            InboundEvent::OutputAudioBufferAppend(data) => {
                let bytes = match protocol::decode_audio_payload(&data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("音声チャンクを破棄: {:#}", e);
                        return;
                    }
                };
                let notices = self.scheduler.enqueue(bytes);
                self.apply(notices);
            }
            InboundEvent::UserSpeechStarted => {
                self.turn.barge_in(
                    &mut self.scheduler,
                    self.sink.as_mut(),
                    self.transport.as_ref(),
                );
                self.status.set_speaker(Some(TurnState::UserSpeaking));
            }
            InboundEvent::UserSpeechStopped => {
                self.turn.on_speech_stopped();
                self.status.set_speaker(None);
            }
        }
    }

    /// デコード完了・再生終了を処理
    pub fn handle_playback_event(&mut self, event: PlaybackEvent) {
        let notices = match event {
            PlaybackEvent::Decoded { ticket, result } => {
                self.scheduler
                    .on_decoded(ticket, result, self.sink.as_mut())
            }
            PlaybackEvent::Ended(handle) => self.scheduler.on_source_ended(handle),
        };
        self.apply(notices);
    }

    fn apply(&mut self, notices: Vec<SchedulerNotice>) {
        for notice in notices {
            match notice {
                SchedulerNotice::DecodeRequested(request) => {
                    let decoder = self.decoder.clone();
                    let tx = self.playback_tx.clone();
                    tokio::spawn(async move {
                        let result = decoder.decode(request.chunk.data).await;
                        let _ = tx.send(PlaybackEvent::Decoded {
                            ticket: request.ticket,
                            result,
                        });
                    });
                }
                SchedulerNotice::Scheduled(_) => {
                    self.turn.on_scheduled(self.transport.as_ref());
                    self.status.set_speaker(Some(TurnState::AiSpeaking));
                }
                SchedulerNotice::Drained => {
                    self.turn.on_drained(self.transport.as_ref());
                    self.status.set_speaker(None);
                }
            }
        }
    }

    /// 入力・出力・チャンネルを解放
    fn teardown(&mut self, end: &SessionEnd) {
        self.source.stop();
        self.scheduler.shutdown(self.sink.as_mut());
        self.sink.stop_all();
        self.transport.close();

        self.status.set_recording(false);
        self.status.set_status(match end {
            SessionEnd::Stopped => SessionStatus::Stopped,
            SessionEnd::ChannelClosed => SessionStatus::Disconnected,
            SessionEnd::ChannelError(_) => SessionStatus::ConnectionError,
        });
        self.status.set_speaker(None);

        log::info!(
            "セッション終了: {:?} (送信 {} フレーム, 破棄 {} フレーム)",
            end,
            self.capture.frames_sent(),
            self.capture.frames_dropped()
        );
    }
}

/// 録音していなければ永久に待つ
async fn recv_frame(frames: &mut Option<mpsc::Receiver<CaptureFrame>>) -> Option<CaptureFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundEvent;
    use crate::status::SpeakerIndicator;
    use crate::testing::{FakeDecoder, FakeSink, FakeSource, RecordingTransport, fake_payload};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use futures_util::stream;

    type Incoming = Result<Message, tungstenite::Error>;

    struct Harness {
        session: Session,
        transport: RecordingTransport,
        sink: FakeSink,
        source: FakeSource,
        status: StatusBoard,
    }

    fn harness(policy: StaleDecodePolicy) -> Harness {
        let transport = RecordingTransport::new();
        let sink = FakeSink::new();
        let source = FakeSource::new();
        let status = StatusBoard::new();
        let session = Session::new(
            Box::new(transport.clone()),
            Box::new(source.clone()),
            Box::new(sink.clone()),
            Arc::new(FakeDecoder),
            policy,
            status.clone(),
            mpsc::unbounded_channel(),
        );
        Harness {
            session,
            transport,
            sink,
            source,
            status,
        }
    }

    fn audio_envelope(tenths: u8) -> String {
        format!(
            r#"{{"event":"output_audio_buffer.append","data":"{}"}}"#,
            STANDARD.encode(fake_payload(tenths))
        )
    }

    fn switches(transport: &RecordingTransport) -> Vec<TurnState> {
        transport
            .sent()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::CurrentSpeakerSwitch(turn) => Some(turn),
                _ => None,
            })
            .collect()
    }

    /// 次の再生イベント（デコード完了）を待って処理する
    async fn pump(session: &mut Session) {
        let event = session
            .playback_rx
            .recv()
            .await
            .expect("playback channel closed");
        session.handle_playback_event(event);
    }

    #[tokio::test]
    async fn test_scenario_a_through_session() {
        let mut h = harness(StaleDecodePolicy::Discard);
        h.sink.set_time(10.0);

        h.session.handle_text(&audio_envelope(5));
        pump(&mut h.session).await;

        let scheduled = h.sink.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1, 10.0);
        assert!((scheduled[0].2 - 0.5).abs() < 1e-9);
        assert_eq!(switches(&h.transport), vec![TurnState::AiSpeaking]);

        h.sink.set_time(10.5);
        h.sink.finish(scheduled[0].0);
        h.session
            .handle_playback_event(PlaybackEvent::Ended(scheduled[0].0));
        assert_eq!(
            switches(&h.transport),
            vec![TurnState::AiSpeaking, TurnState::None]
        );
    }

    #[tokio::test]
    async fn test_scenario_b_through_session() {
        let mut h = harness(StaleDecodePolicy::Discard);

        h.session.handle_text(&audio_envelope(5));
        h.session.handle_text(&audio_envelope(3));
        pump(&mut h.session).await;

        let a = h.sink.scheduled()[0];
        h.sink.set_time(0.5);
        h.sink.finish(a.0);
        h.session.handle_playback_event(PlaybackEvent::Ended(a.0));
        pump(&mut h.session).await;

        let scheduled = h.sink.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].1, 0.0);
        assert!((scheduled[1].1 - 0.5).abs() < 1e-9);

        // 予約のたびに "ai"
        assert_eq!(
            switches(&h.transport),
            vec![TurnState::AiSpeaking, TurnState::AiSpeaking]
        );
    }

    #[tokio::test]
    async fn test_scenario_c_barge_in_through_session() {
        let mut h = harness(StaleDecodePolicy::Discard);
        h.session.status.set_recording(true);

        h.session.handle_text(&audio_envelope(5));
        h.session.handle_text(&audio_envelope(5));
        pump(&mut h.session).await;
        let a = h.sink.scheduled()[0];

        h.sink.set_time(0.2);
        h.session.handle_text(r#"{"event":"user.speech_started"}"#);

        assert_eq!(h.sink.stopped(), vec![a.0]);
        assert!(h.sink.active().is_empty());
        assert_eq!(
            switches(&h.transport),
            vec![TurnState::AiSpeaking, TurnState::UserSpeaking]
        );
        assert_eq!(h.status.snapshot().speaker, SpeakerIndicator::UserSpeaking);

        // 停止したソースの終了通知では継続しない
        h.session.handle_playback_event(PlaybackEvent::Ended(a.0));
        assert_eq!(h.sink.scheduled().len(), 1);
        assert!(h.session.playback_rx.try_recv().is_err());

        h.session.handle_text(r#"{"event":"user.speech_stopped"}"#);
        assert_eq!(h.status.snapshot().speaker, SpeakerIndicator::Ready);
        assert_eq!(switches(&h.transport).len(), 2);
    }

    #[tokio::test]
    async fn test_stale_decode_discarded_through_session() {
        let mut h = harness(StaleDecodePolicy::Discard);

        h.session.handle_text(&audio_envelope(5));
        // デコード結果が届く前に割り込み
        h.session.handle_text(r#"{"event":"user.speech_started"}"#);
        pump(&mut h.session).await;

        assert!(h.sink.scheduled().is_empty());
        assert_eq!(switches(&h.transport), vec![TurnState::UserSpeaking]);
    }

    #[tokio::test]
    async fn test_chunk_arriving_during_stale_decode_is_played() {
        let mut h = harness(StaleDecodePolicy::Discard);

        h.session.handle_text(&audio_envelope(5));
        h.session.handle_text(r#"{"event":"user.speech_started"}"#);
        h.session.handle_text(&audio_envelope(3));

        // A の結果は破棄され、続けて B のデコードが始まる
        pump(&mut h.session).await;
        pump(&mut h.session).await;

        let scheduled = h.sink.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert!((scheduled[0].2 - 0.3).abs() < 1e-9);
        assert_eq!(h.session.scheduler.queue_len(), 0);
        assert_eq!(
            switches(&h.transport),
            vec![TurnState::UserSpeaking, TurnState::AiSpeaking]
        );
    }

    #[tokio::test]
    async fn test_stale_decode_scheduled_through_session() {
        let mut h = harness(StaleDecodePolicy::Schedule);

        h.session.handle_text(&audio_envelope(5));
        h.session.handle_text(r#"{"event":"user.speech_started"}"#);
        pump(&mut h.session).await;

        assert_eq!(h.sink.scheduled().len(), 1);
        assert_eq!(
            switches(&h.transport),
            vec![TurnState::UserSpeaking, TurnState::AiSpeaking]
        );
    }

    #[tokio::test]
    async fn test_malformed_envelopes_are_discarded() {
        let mut h = harness(StaleDecodePolicy::Discard);

        h.session.handle_text("{not json");
        h.session.handle_text(r#"{"event":"unknown.event"}"#);
        h.session
            .handle_text(r#"{"event":"output_audio_buffer.append","data":"%%%"}"#);
        assert!(h.transport.sent().is_empty());
        assert!(h.session.scheduler.is_idle());
        assert_eq!(h.session.scheduler.queue_len(), 0);

        // 後続の正常なチャンクは影響を受けない
        h.session.handle_text(&audio_envelope(2));
        pump(&mut h.session).await;
        assert_eq!(h.sink.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_skips_chunk() {
        let mut h = harness(StaleDecodePolicy::Discard);

        // 空ペイロードは FakeDecoder で失敗する
        h.session
            .handle_text(r#"{"event":"output_audio_buffer.append","data":""}"#);
        h.session.handle_text(&audio_envelope(3));
        pump(&mut h.session).await;
        pump(&mut h.session).await;

        let scheduled = h.sink.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert!((scheduled[0].2 - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_capture_frames_sent_only_when_open() {
        let mut h = harness(StaleDecodePolicy::Discard);

        h.session.handle_frame(&[1.0, -1.0]);
        h.transport.set_open(false);
        h.session.handle_frame(&[0.5, 0.5]);

        let sent = h.transport.sent();
        assert_eq!(sent, vec![OutboundEvent::audio_append(&[32767, -32768])]);
    }

    #[tokio::test]
    async fn test_run_until_channel_closes() {
        let h = harness(StaleDecodePolicy::Discard);
        let transport = h.transport.clone();
        let source = h.source.clone();
        let status = h.status.clone();

        let reader = stream::iter(vec![Incoming::Ok(Message::Text(
            r#"{"event":"user.speech_started"}"#.into(),
        ))]);
        let running = Arc::new(AtomicBool::new(true));

        let end = h.session.run(reader, running).await;

        assert_eq!(end, SessionEnd::ChannelClosed);
        assert!(source.is_started());
        assert!(source.is_stopped());
        assert!(!transport.is_open());
        assert_eq!(switches(&transport), vec![TurnState::UserSpeaking]);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Disconnected);
        assert_eq!(snapshot.speaker, SpeakerIndicator::NotConnected);
        assert!(!snapshot.recording);
    }

    #[tokio::test]
    async fn test_run_reports_channel_error() {
        let h = harness(StaleDecodePolicy::Discard);
        let status = h.status.clone();

        let reader = stream::iter(vec![Incoming::Err(tungstenite::Error::ConnectionClosed)]);
        let end = h.session.run(reader, Arc::new(AtomicBool::new(true))).await;

        assert!(matches!(end, SessionEnd::ChannelError(_)));
        assert_eq!(status.snapshot().status, SessionStatus::ConnectionError);
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let h = harness(StaleDecodePolicy::Discard);
        let source = h.source.clone();
        let status = h.status.clone();

        let running = Arc::new(AtomicBool::new(false));
        let end = h.session.run(stream::pending::<Incoming>(), running).await;

        assert_eq!(end, SessionEnd::Stopped);
        assert!(source.is_stopped());
        assert_eq!(status.snapshot().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_run_forwards_capture_frames() {
        let h = harness(StaleDecodePolicy::Discard);
        let transport = h.transport.clone();
        let source = h.source.clone();

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let feeder = async move {
            // run() が録音を開始するまで待つ
            let tx = loop {
                if let Some(tx) = source.frame_tx() {
                    break tx;
                }
                tokio::task::yield_now().await;
            };
            tx.send(vec![0.0; 4]).await.unwrap();
            tx.send(vec![1.0; 4]).await.unwrap();
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            running_clone.store(false, Ordering::SeqCst);
        };

        let (end, _) = tokio::join!(h.session.run(stream::pending::<Incoming>(), running), feeder);

        assert_eq!(end, SessionEnd::Stopped);
        assert_eq!(
            transport.sent(),
            vec![
                OutboundEvent::audio_append(&[0; 4]),
                OutboundEvent::audio_append(&[32767; 4]),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_stops_while_frames_keep_arriving() {
        let h = harness(StaleDecodePolicy::Discard);
        let source = h.source.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        // 停止要求の後もフレームを送り続ける
        let feeder = tokio::spawn(async move {
            let tx = loop {
                if let Some(tx) = source.frame_tx() {
                    break tx;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
            };
            for i in 0..500 {
                if i == 3 {
                    running_clone.store(false, Ordering::SeqCst);
                }
                if tx.send(vec![0.0; 4]).await.is_err() {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
            }
        });

        let end = tokio::time::timeout(
            tokio::time::Duration::from_secs(2),
            h.session.run(stream::pending::<Incoming>(), running),
        )
        .await
        .expect("run() did not stop while frames were flowing");

        assert_eq!(end, SessionEnd::Stopped);
        assert!(h.source.is_stopped());
        feeder.abort();
    }
}
