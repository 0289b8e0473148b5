use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc::UnboundedSender};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

#[tokio::main]
async fn main() {
    let p1 = spawn_player("alice").await;
    let p2 = spawn_player("bob").await;

    p1.send(r#"{"type":"Hello","player_id":"alice"}"#.to_string())
        .unwrap();
    p2.send(r#"{"type":"Hello","player_id":"bob"}"#.to_string())
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    p1.send(r#"{"type":"JoinQueue"}"#.to_string()).unwrap();
    p2.send(r#"{"type":"JoinQueue"}"#.to_string()).unwrap();

    // Both MatchFound messages arrive once the sweeper pairs them; the
    // printed initial states show whose turn it is.
    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

    p1.send(r#"{"type":"Heartbeat"}"#.to_string()).unwrap();
    p2.send(r#"{"type":"Heartbeat"}"#.to_string()).unwrap();

    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
}

async fn create_connection() -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let port = std::env::var("DOMINO_WS_PORT").unwrap_or_else(|_| "9800".to_string());
    let (ws_stream, _) = connect_async(format!("ws://localhost:{}", port))
        .await
        .expect("Failed to connect");
    ws_stream
}

async fn spawn_player(name: &str) -> UnboundedSender<String> {
    let mut ws_stream = create_connection().await;
    let name = name.to_string();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if ws_stream.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(msg)) = ws_stream.next() => {
                    println!("{} received: {:?}", name, msg);
                }
                else => break,
            }
        }
    });
    tx
}
