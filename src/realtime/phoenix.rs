//! Websocket transport speaking the backend's Phoenix-channel realtime protocol.
//!
//! One socket per channel: join with a `postgres_changes` config, then
//! forward change frames until the server or socket closes.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use super::{ChannelSpec, FeedChannel, FeedMessage, FeedTransport};
use crate::remote::RemoteError;

const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_REF: &str = "1";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RealtimeTransport {
  endpoint: Url,
  access_token: Option<String>,
  heartbeat: Duration,
}

impl RealtimeTransport {
  pub fn new(
    realtime_url: &str,
    api_key: &str,
    access_token: Option<String>,
    heartbeat: Duration,
  ) -> Result<Self, RemoteError> {
    let mut endpoint = Url::parse(realtime_url)
      .map_err(|e| RemoteError::Decode(format!("invalid realtime url {}: {}", realtime_url, e)))?;
    endpoint
      .query_pairs_mut()
      .append_pair("apikey", api_key)
      .append_pair("vsn", PROTOCOL_VERSION);

    Ok(Self {
      endpoint,
      access_token,
      heartbeat,
    })
  }

  fn join_frame(&self, spec: &ChannelSpec) -> Value {
    json!({
      "topic": channel_topic(spec),
      "event": "phx_join",
      "payload": {
        "config": {
          "broadcast": { "self": false },
          "presence": { "key": "" },
          "postgres_changes": [{
            "event": "*",
            "schema": "public",
            "table": spec.kind.table(),
            "filter": spec.filter.to_expression(),
          }],
        },
        "access_token": self.access_token,
      },
      "ref": JOIN_REF,
      "join_ref": JOIN_REF,
    })
  }
}

#[async_trait]
impl FeedTransport for RealtimeTransport {
  async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, RemoteError> {
    let topic = channel_topic(spec);
    let (socket, _) = connect_async(self.endpoint.as_str())
      .await
      .map_err(|e| RemoteError::Transient(format!("realtime connect failed: {}", e)))?;
    let (mut write, mut read) = socket.split();

    write
      .send(Message::Text(self.join_frame(spec).to_string()))
      .await
      .map_err(|e| RemoteError::Transient(format!("failed to send join: {}", e)))?;

    tokio::time::timeout(JOIN_TIMEOUT, await_join(&mut read, &topic))
      .await
      .map_err(|_| RemoteError::Transient(format!("timed out joining {}", topic)))??;
    debug!(topic = %topic, "joined realtime channel");

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(write, read, topic, self.heartbeat, tx));

    let channel = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    Ok(channel.boxed())
  }
}

fn channel_topic(spec: &ChannelSpec) -> String {
  format!("realtime:{}", spec.topic())
}

#[derive(Debug, Deserialize)]
struct Frame {
  topic: String,
  event: String,
  #[serde(default)]
  payload: Value,
  #[serde(rename = "ref", default)]
  reference: Option<String>,
}

async fn await_join(read: &mut SplitStream<Socket>, topic: &str) -> Result<(), RemoteError> {
  while let Some(message) = read.next().await {
    let text = match message {
      Ok(Message::Text(text)) => text,
      Ok(Message::Close(_)) => break,
      Ok(_) => continue,
      Err(e) => return Err(RemoteError::Transient(format!("realtime read failed: {}", e))),
    };

    let frame: Frame = match serde_json::from_str(&text) {
      Ok(frame) => frame,
      Err(_) => continue,
    };
    if frame.topic != topic || frame.event != "phx_reply" || frame.reference.as_deref() != Some(JOIN_REF) {
      continue;
    }
    return join_result(&frame.payload);
  }
  Err(RemoteError::Transient("socket closed while joining".to_string()))
}

fn join_result(payload: &Value) -> Result<(), RemoteError> {
  if payload["status"] == "ok" {
    return Ok(());
  }
  let reason = payload["response"]["reason"]
    .as_str()
    .unwrap_or("join refused")
    .to_string();
  let lowered = reason.to_lowercase();
  if lowered.contains("token") || lowered.contains("auth") {
    Err(RemoteError::Unauthorized(reason))
  } else {
    Err(RemoteError::Transient(reason))
  }
}

/// Forward frames to `tx` and keep the socket alive until either side goes away.
async fn pump(
  mut write: SplitSink<Socket, Message>,
  mut read: SplitStream<Socket>,
  topic: String,
  heartbeat: Duration,
  tx: mpsc::UnboundedSender<FeedMessage>,
) {
  let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
  let mut next_ref: u64 = 1;

  loop {
    tokio::select! {
      _ = tx.closed() => {
        let leave = json!({"topic": topic, "event": "phx_leave", "payload": {}, "ref": null});
        let _ = write.send(Message::Text(leave.to_string())).await;
        let _ = write.close().await;
        debug!(topic = %topic, "left realtime channel");
        return;
      }

      _ = ticker.tick() => {
        next_ref += 1;
        let frame = json!({
          "topic": "phoenix",
          "event": "heartbeat",
          "payload": {},
          "ref": next_ref.to_string(),
        });
        if let Err(e) = write.send(Message::Text(frame.to_string())).await {
          warn!(topic = %topic, error = %e, "heartbeat failed");
          let _ = tx.send(FeedMessage::Closed);
          return;
        }
      }

      message = read.next() => match message {
        Some(Ok(Message::Text(text))) => {
          if let Some(event) = decode_frame(&text, &topic) {
            let closed = event == FeedMessage::Closed;
            if tx.send(event).is_err() || closed {
              return;
            }
          }
        }
        Some(Ok(Message::Close(frame))) => {
          debug!(topic = %topic, ?frame, "realtime socket closed by server");
          let _ = tx.send(FeedMessage::Closed);
          return;
        }
        Some(Ok(_)) => {}
        Some(Err(e)) => {
          warn!(topic = %topic, error = %e, "realtime read failed");
          let _ = tx.send(FeedMessage::Closed);
          return;
        }
        None => {
          let _ = tx.send(FeedMessage::Closed);
          return;
        }
      }
    }
  }
}

/// Translate one server frame for `topic` into a feed event.
///
/// Replies, presence and frames for other topics yield `None`.
fn decode_frame(text: &str, topic: &str) -> Option<FeedMessage> {
  let frame: Frame = match serde_json::from_str(text) {
    Ok(frame) => frame,
    Err(e) => {
      warn!(error = %e, "ignoring malformed realtime frame");
      return None;
    }
  };
  if frame.topic != topic {
    return None;
  }

  match frame.event.as_str() {
    "postgres_changes" => decode_change(&frame.payload),
    "phx_close" | "phx_error" => Some(FeedMessage::Closed),
    "system" if frame.payload["status"] == "error" => Some(FeedMessage::Closed),
    other => {
      trace!(event = other, "ignoring realtime frame");
      None
    }
  }
}

fn decode_change(payload: &Value) -> Option<FeedMessage> {
  let data = payload.get("data")?;
  let record = |field: &str| data.get(field).filter(|v| v.is_object()).cloned();

  match data.get("type")?.as_str()? {
    "INSERT" => record("record").map(FeedMessage::Insert),
    "UPDATE" => record("record").map(FeedMessage::Update),
    "DELETE" => record("old_record").map(FeedMessage::Delete),
    other => {
      trace!(change = other, "ignoring change type");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::Filter;
  use crate::resource::ResourceKind;

  const TOPIC: &str = "realtime:notes:workspace_id=eq.ws1";

  fn change(kind: &str, data: Value) -> String {
    let mut data = data;
    data["type"] = json!(kind);
    json!({
      "topic": TOPIC,
      "event": "postgres_changes",
      "payload": { "ids": [1], "data": data },
      "ref": null
    })
    .to_string()
  }

  #[test]
  fn test_insert_and_update_carry_new_record() {
    let insert = change("INSERT", json!({"record": {"id": "n1"}, "old_record": null}));
    let update = change("UPDATE", json!({"record": {"id": "n1", "title": "b"}, "old_record": {"id": "n1"}}));

    assert_eq!(
      decode_frame(&insert, TOPIC),
      Some(FeedMessage::Insert(json!({"id": "n1"})))
    );
    assert_eq!(
      decode_frame(&update, TOPIC),
      Some(FeedMessage::Update(json!({"id": "n1", "title": "b"})))
    );
  }

  #[test]
  fn test_delete_carries_old_record() {
    let delete = change("DELETE", json!({"record": null, "old_record": {"id": "n1"}}));
    assert_eq!(
      decode_frame(&delete, TOPIC),
      Some(FeedMessage::Delete(json!({"id": "n1"})))
    );
  }

  #[test]
  fn test_server_close_and_errors_end_the_channel() {
    for event in ["phx_close", "phx_error"] {
      let frame = json!({"topic": TOPIC, "event": event, "payload": {}, "ref": "1"}).to_string();
      assert_eq!(decode_frame(&frame, TOPIC), Some(FeedMessage::Closed));
    }

    let system = json!({
      "topic": TOPIC,
      "event": "system",
      "payload": {"status": "error", "message": "subscription failed"},
      "ref": null
    })
    .to_string();
    assert_eq!(decode_frame(&system, TOPIC), Some(FeedMessage::Closed));
  }

  #[test]
  fn test_replies_and_other_topics_are_ignored() {
    let heartbeat = json!({
      "topic": "phoenix",
      "event": "phx_reply",
      "payload": {"status": "ok", "response": {}},
      "ref": "2"
    })
    .to_string();
    let ok_system = json!({"topic": TOPIC, "event": "system", "payload": {"status": "ok"}}).to_string();

    assert_eq!(decode_frame(&heartbeat, TOPIC), None);
    assert_eq!(decode_frame(&ok_system, TOPIC), None);
    assert_eq!(decode_frame("not json", TOPIC), None);
  }

  #[test]
  fn test_join_result_classifies_refusals() {
    assert!(join_result(&json!({"status": "ok", "response": {}})).is_ok());
    assert!(matches!(
      join_result(&json!({"status": "error", "response": {"reason": "Invalid JWT token"}})),
      Err(RemoteError::Unauthorized(_))
    ));
    assert!(matches!(
      join_result(&json!({"status": "error", "response": {}})),
      Err(RemoteError::Transient(_))
    ));
  }

  #[test]
  fn test_join_frame_subscribes_to_filtered_table() {
    let transport = RealtimeTransport::new(
      "wss://example.test/realtime/v1/websocket",
      "anon",
      Some("jwt".to_string()),
      Duration::from_secs(30),
    )
    .unwrap();
    let spec = ChannelSpec::new(ResourceKind::Notes, Filter::eq("workspace_id", "ws1"));

    let frame = transport.join_frame(&spec);
    assert_eq!(frame["topic"], TOPIC);
    assert_eq!(frame["event"], "phx_join");
    let changes = &frame["payload"]["config"]["postgres_changes"][0];
    assert_eq!(changes["table"], "notes");
    assert_eq!(changes["filter"], "workspace_id=eq.ws1");
    assert_eq!(frame["payload"]["access_token"], "jwt");

    let query: Vec<_> = transport.endpoint.query_pairs().into_owned().collect();
    assert!(query.contains(&("apikey".to_string(), "anon".to_string())));
    assert!(query.contains(&("vsn".to_string(), "1.0.0".to_string())));
  }
}
