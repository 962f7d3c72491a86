use crate::protocol::OutboundEvent;
use anyhow::{Context, Result};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

/// 受信側のストリーム
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 送信用の双方向チャンネル
pub trait Transport {
    /// 送信可能な状態かどうか
    fn is_open(&self) -> bool;

    /// エンベロープを送信キューに積む
    fn send(&self, event: &OutboundEvent) -> Result<()>;

    /// チャンネルを閉じる
    fn close(&self);

    /// 開いていれば送信し、閉じていれば何もしない
    ///
    /// 送信失敗は呼び出し側に伝えず、ログだけ残す。
    fn send_if_open(&self, event: &OutboundEvent) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.send(event) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("{} の送信に失敗: {:#}", event.name(), e);
                false
            }
        }
    }
}

/// WebSocket による Transport 実装
///
/// 送信はアンバウンドなキューを経由して書き込みタスクに渡すため、呼び出し側は待たない。
/// キューに積んだ順に送信される。
pub struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl WsTransport {
    /// サーバーに接続し、(送信側, 受信ストリーム, 書き込みタスク) を返す
    pub async fn connect(url: &Url) -> Result<(Self, WsReader, JoinHandle<()>)> {
        log::info!("接続中: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("WebSocket 接続に失敗: {}", url))?;

        log::info!("接続しました: {}", url);

        let (mut ws_sink, ws_reader) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        let open_clone = open.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_sink.send(message).await {
                    log::error!("WebSocket 送信エラー: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            open_clone.store(false, Ordering::SeqCst);
            let _ = ws_sink.close().await;
            log::debug!("WebSocket 書き込みタスクを終了");
        });

        Ok((Self { tx, open }, ws_reader, writer))
    }
}

impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send(&self, event: &OutboundEvent) -> Result<()> {
        let json = event.to_json()?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| anyhow::anyhow!("送信キューがクローズされています"))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(None));
            log::info!("WebSocket をクローズします");
        }
    }
}
