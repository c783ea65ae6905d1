//! mirai-api-http (v2) transport: verify/bind a session, long-poll fetchMessage, send and upload
//! via HTTP.

use crate::message::{ContentItem, GroupInfo, UserInfo};
use crate::transport::{
    Transport, TransportError, TransportEvent, UploadTarget, EVENT_QUEUE_CAPACITY,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const DEFAULT_FETCH_COUNT: u32 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ApiStatus {
    code: i64,
    #[serde(default)]
    msg: String,
}

impl ApiStatus {
    fn check(self) -> Result<(), TransportError> {
        if self.code == 0 {
            Ok(())
        } else {
            Err(TransportError::Api {
                code: self.code,
                msg: self.msg,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: String,
}

/// fetchMessage data item. Non-message events (bot online, member join, ...) land in `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    FriendMessage {
        sender: WireFriend,
        #[serde(rename = "messageChain", default)]
        message_chain: Vec<Value>,
    },
    GroupMessage {
        sender: WireMember,
        #[serde(rename = "messageChain", default)]
        message_chain: Vec<Value>,
    },
    TempMessage {
        sender: WireMember,
        #[serde(rename = "messageChain", default)]
        message_chain: Vec<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireFriend {
    id: i64,
    #[serde(default)]
    nickname: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMember {
    id: i64,
    #[serde(default)]
    member_name: String,
    group: WireGroup,
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    id: i64,
    #[serde(default)]
    name: String,
}

impl WireMember {
    fn split(self) -> (UserInfo, GroupInfo) {
        (
            UserInfo {
                id: self.id,
                name: self.member_name,
            },
            GroupInfo {
                id: self.group.id,
                name: self.group.name,
            },
        )
    }
}

impl WireEvent {
    fn into_event(self) -> Option<TransportEvent> {
        match self {
            WireEvent::FriendMessage {
                sender,
                message_chain,
            } => Some(TransportEvent::Friend {
                sender: UserInfo {
                    id: sender.id,
                    name: sender.nickname,
                },
                chain: chain_from_wire(message_chain),
            }),
            WireEvent::GroupMessage {
                sender,
                message_chain,
            } => {
                let (sender, group) = sender.split();
                Some(TransportEvent::Group {
                    sender,
                    group,
                    chain: chain_from_wire(message_chain),
                })
            }
            WireEvent::TempMessage {
                sender,
                message_chain,
            } => {
                let (sender, group) = sender.split();
                Some(TransportEvent::Temp {
                    sender,
                    group,
                    chain: chain_from_wire(message_chain),
                })
            }
            WireEvent::Other => None,
        }
    }
}

/// Convert a wire message chain. The leading `Source` item is metadata, not content, and is dropped.
fn chain_from_wire(items: Vec<Value>) -> Vec<ContentItem> {
    items.into_iter().filter_map(content_from_wire).collect()
}

fn content_from_wire(value: Value) -> Option<ContentItem> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !matches!(kind.as_str(), "Source" | "Plain" | "Image" | "Face" | "At") {
        return Some(ContentItem::Other { kind, raw: value });
    }
    let item = match kind.as_str() {
        "Plain" => ContentItem::Plain(str_field(&value, "text").unwrap_or_default()),
        "Image" => ContentItem::Image {
            image_id: str_field(&value, "imageId"),
            url: str_field(&value, "url"),
        },
        "Face" => ContentItem::Face {
            face_id: value.get("faceId").and_then(Value::as_i64).unwrap_or_default(),
            name: str_field(&value, "name"),
        },
        "At" => ContentItem::At {
            target: value.get("target").and_then(Value::as_i64).unwrap_or_default(),
        },
        // Source
        _ => return None,
    };
    Some(item)
}

fn str_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

fn content_to_wire(item: &ContentItem) -> Value {
    match item {
        ContentItem::Plain(text) => json!({ "type": "Plain", "text": text }),
        ContentItem::Image { image_id, url } => {
            let mut v = json!({ "type": "Image" });
            if let Some(id) = image_id {
                v["imageId"] = Value::String(id.clone());
            }
            if let Some(u) = url {
                v["url"] = Value::String(u.clone());
            }
            v
        }
        ContentItem::Face { face_id, name } => {
            let mut v = json!({ "type": "Face", "faceId": face_id });
            if let Some(n) = name {
                v["name"] = Value::String(n.clone());
            }
            v
        }
        ContentItem::At { target } => json!({ "type": "At", "target": target }),
        ContentItem::Other { raw, .. } => raw.clone(),
    }
}

fn chain_to_wire(chain: &[ContentItem]) -> Vec<Value> {
    chain.iter().map(content_to_wire).collect()
}

/// mirai-api-http connector: polls fetchMessage and forwards events to the subscriber.
pub struct MiraiTransport {
    id: String,
    base_url: String,
    verify_key: Option<String>,
    qq: i64,
    fetch_count: u32,
    poll_interval: Duration,
    running: AtomicBool,
    client: reqwest::Client,
    session_key: RwLock<Option<String>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MiraiTransport {
    pub fn new(base_url: impl Into<String>, verify_key: Option<String>, qq: i64) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            id: "mirai".to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            verify_key,
            qq,
            fetch_count: DEFAULT_FETCH_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
            session_key: RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Messages requested per fetchMessage call and the pause after an empty poll.
    pub fn with_polling(mut self, fetch_count: u32, poll_interval: Duration) -> Self {
        self.fetch_count = fetch_count.max(1);
        self.poll_interval = poll_interval;
        self
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn session_key(&self) -> Result<String, TransportError> {
        self.session_key
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, TransportError> {
        let res = self.client.post(self.url(path)).json(body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                code: i64::from(status.as_u16()),
                msg: format!("{} failed: {}", path, body),
            });
        }
        Ok(res.json().await?)
    }

    /// Verify with the configured key and bind the session to the bot account.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let verify: VerifyResponse = self
            .post(
                "verify",
                &json!({ "verifyKey": self.verify_key.as_deref().unwrap_or("") }),
            )
            .await?;
        let session = match (verify.code, verify.session) {
            (0, Some(s)) => s,
            (code, _) => {
                return Err(TransportError::Api {
                    code,
                    msg: verify.msg,
                })
            }
        };
        let status: ApiStatus = self
            .post("bind", &json!({ "sessionKey": session, "qq": self.qq }))
            .await?;
        status.check()?;
        *self.session_key.write().await = Some(session);
        log::info!("mirai: session bound for qq {}", self.qq);
        Ok(())
    }

    /// Release the bound session. No-op when not connected.
    pub async fn release(&self) -> Result<(), TransportError> {
        let Some(session) = self.session_key.write().await.take() else {
            return Ok(());
        };
        let status: ApiStatus = self
            .post("release", &json!({ "sessionKey": session, "qq": self.qq }))
            .await?;
        status.check()
    }

    /// Start the fetchMessage poll loop. Returns a handle to await on shutdown.
    pub fn start_polling(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("mirai transport: starting fetchMessage poll loop");
        tokio::spawn(async move {
            run_fetch_loop(self).await;
        })
    }

    /// Stop the poll loop after the current fetch.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn fetch_messages(&self) -> Result<Vec<TransportEvent>, TransportError> {
        let session = self.session_key().await?;
        let res = self
            .client
            .get(self.url("fetchMessage"))
            .query(&[
                ("sessionKey", session),
                ("count", self.fetch_count.to_string()),
            ])
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                code: i64::from(status.as_u16()),
                msg: format!("fetchMessage failed: {}", body),
            });
        }
        let data: FetchResponse = res.json().await?;
        if data.code != 0 {
            return Err(TransportError::Api {
                code: data.code,
                msg: data.msg,
            });
        }
        Ok(data
            .data
            .into_iter()
            .filter_map(WireEvent::into_event)
            .collect())
    }

    async fn send(&self, path: &str, mut body: Value) -> Result<(), TransportError> {
        body["sessionKey"] = Value::String(self.session_key().await?);
        let status: ApiStatus = self.post(path, &body).await?;
        status.check()
    }
}

async fn run_fetch_loop(transport: Arc<MiraiTransport>) {
    while transport.running() {
        match transport.fetch_messages().await {
            Ok(events) => {
                let idle = events.is_empty();
                for event in events {
                    if transport.events_tx.send(event).await.is_err() {
                        log::debug!("mirai: event subscriber dropped, stopping loop");
                        return;
                    }
                }
                if idle {
                    tokio::time::sleep(transport.poll_interval).await;
                }
            }
            Err(e) => {
                log::debug!("mirai fetchMessage error: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
    log::info!("mirai transport: poll loop stopped");
}

#[async_trait]
impl Transport for MiraiTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn send_to_user(
        &self,
        user_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError> {
        self.send(
            "sendFriendMessage",
            json!({ "target": user_id, "messageChain": chain_to_wire(chain) }),
        )
        .await
    }

    async fn send_to_group(
        &self,
        group_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError> {
        self.send(
            "sendGroupMessage",
            json!({ "target": group_id, "messageChain": chain_to_wire(chain) }),
        )
        .await
    }

    async fn send_to_temp(
        &self,
        user_id: i64,
        group_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError> {
        self.send(
            "sendTempMessage",
            json!({ "qq": user_id, "group": group_id, "messageChain": chain_to_wire(chain) }),
        )
        .await
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        target: UploadTarget,
    ) -> Result<ContentItem, TransportError> {
        let session = self.session_key().await?;
        let form = reqwest::multipart::Form::new()
            .text("sessionKey", session)
            .text("type", target.as_str())
            .part(
                "img",
                reqwest::multipart::Part::bytes(bytes).file_name("image.png"),
            );
        let res = self
            .client
            .post(self.url("uploadImage"))
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                code: i64::from(status.as_u16()),
                msg: format!("uploadImage failed: {}", body),
            });
        }
        let data: UploadResponse = res.json().await?;
        match data.image_id {
            Some(image_id) => Ok(ContentItem::Image {
                image_id: Some(image_id),
                url: data.url,
            }),
            None => Err(TransportError::Api {
                code: data.code.unwrap_or(-1),
                msg: data.msg,
            }),
        }
    }
}
