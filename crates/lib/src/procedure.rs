//! Procedures: one running conversation with a fixed counterpart.
//!
//! A `Procedure` is the shared half (identity, inbox, finished flag) held by the dispatcher's
//! live set. A `ProcedureContext` is the half handed to the conversation body: it is the only
//! consumer of the inbox and the only way the body talks back to its counterpart.

use crate::message::{chain_text, ContentItem, Message, Sender, SourceType};
use crate::transport::{Transport, TransportError, UploadTarget};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ProcedureError {
    #[error("procedure already finished")]
    Finished,
    #[error("procedure idle timeout")]
    IdleTimeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Sequential conversation body. `run` consumes the conversation, so it executes at most once.
#[async_trait]
pub trait Conversation: Send {
    async fn run(self: Box<Self>, ctx: ProcedureContext) -> anyhow::Result<()>;
}

struct FnConversation<F>(F);

#[async_trait]
impl<F, Fut> Conversation for FnConversation<F>
where
    F: FnOnce(ProcedureContext) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(self: Box<Self>, ctx: ProcedureContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a conversation body.
pub fn conversation_fn<F, Fut>(f: F) -> Box<dyn Conversation>
where
    F: FnOnce(ProcedureContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(FnConversation(f))
}

/// Unbounded FIFO with an async wait for the single consumer.
#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    ready: Notify,
}

impl Inbox {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared state of one conversation.
pub struct Procedure {
    id: String,
    init_message: Message,
    inbox: Inbox,
    finished: AtomicBool,
}

impl Procedure {
    /// Create a procedure for `init_message`; the inbox starts with that message queued.
    pub fn new(init_message: Message) -> Self {
        let inbox = Inbox::default();
        inbox.lock().push_back(init_message.clone());
        Self {
            id: format!("proc-{}", uuid::Uuid::new_v4()),
            init_message,
            inbox,
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The message that started this procedure; fixes which counterpart it accepts.
    pub fn init_message(&self) -> &Message {
        &self.init_message
    }

    pub fn source(&self) -> SourceType {
        self.init_message.source()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Number of messages queued and not yet read.
    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().len()
    }

    /// True iff `msg` comes from this procedure's counterpart: same source kind and same user,
    /// and for group/temp messages also the same group.
    pub fn is_my_msg(&self, msg: &Message) -> bool {
        match (self.init_message.sender(), msg.sender()) {
            (Sender::Friend(mine), Sender::Friend(theirs)) => mine.id == theirs.id,
            (
                Sender::Group {
                    member: mine,
                    group: my_group,
                },
                Sender::Group {
                    member: theirs,
                    group: their_group,
                },
            )
            | (
                Sender::Temp {
                    member: mine,
                    group: my_group,
                },
                Sender::Temp {
                    member: theirs,
                    group: their_group,
                },
            ) => mine.id == theirs.id && my_group.id == their_group.id,
            _ => false,
        }
    }

    /// Queue `msg` if the procedure is still running and the message is ours. Returns whether it was queued.
    pub fn recv_msg(&self, msg: Message) -> bool {
        if !self.is_my_msg(&msg) {
            return false;
        }
        {
            let mut queue = self.inbox.lock();
            if self.is_finished() {
                return false;
            }
            queue.push_back(msg);
        }
        self.inbox.ready.notify_one();
        true
    }

    /// Force-finish from outside the conversation body. A blocked read wakes and fails with `Finished`.
    pub fn abort(&self) -> Result<(), ProcedureError> {
        if self.mark_finished() {
            log::debug!("procedure {}: aborted", self.id);
            Ok(())
        } else {
            Err(ProcedureError::Finished)
        }
    }

    /// Set the finished flag; returns false if it was already set.
    fn mark_finished(&self) -> bool {
        let was_finished = {
            let _queue = self.inbox.lock();
            self.finished.swap(true, Ordering::SeqCst)
        };
        self.inbox.ready.notify_one();
        !was_finished
    }

    async fn next_message(&self) -> Result<Message, ProcedureError> {
        loop {
            if self.is_finished() {
                return Err(ProcedureError::Finished);
            }
            let next = self.inbox.lock().pop_front();
            if let Some(msg) = next {
                return Ok(msg);
            }
            self.inbox.ready.notified().await;
        }
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("id", &self.id)
            .field("sender", self.init_message.sender())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Handle given to a conversation body: reads from the inbox and sends to the counterpart.
pub struct ProcedureContext {
    procedure: Arc<Procedure>,
    transport: Arc<dyn Transport>,
    idle_timeout: Option<Duration>,
}

impl ProcedureContext {
    pub(crate) fn new(
        procedure: Arc<Procedure>,
        transport: Arc<dyn Transport>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            procedure,
            transport,
            idle_timeout,
        }
    }

    pub fn procedure(&self) -> &Arc<Procedure> {
        &self.procedure
    }

    pub fn init_message(&self) -> &Message {
        self.procedure.init_message()
    }

    pub fn source(&self) -> SourceType {
        self.procedure.source()
    }

    /// Counterpart user id.
    pub fn user_id(&self) -> i64 {
        self.init_message().sender().user_id()
    }

    /// Counterpart group id; `None` for friend conversations.
    pub fn group_id(&self) -> Option<i64> {
        self.init_message().sender().group_id()
    }

    /// Direct access to the transport, for anything the helpers below do not cover.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Wait for the next message from the counterpart, in arrival order.
    ///
    /// Fails with `Finished` once the procedure has finished, and with `IdleTimeout` (after aborting
    /// the procedure) when an idle timeout is configured and no message arrives in time.
    pub async fn read_item(&self) -> Result<Message, ProcedureError> {
        match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.procedure.next_message()).await {
                Ok(res) => res,
                Err(_) => {
                    self.procedure.abort()?;
                    log::info!(
                        "procedure {}: idle for {:?}, aborted",
                        self.procedure.id(),
                        limit
                    );
                    Err(ProcedureError::IdleTimeout)
                }
            },
            None => self.procedure.next_message().await,
        }
    }

    /// Read the next message and return its text runs concatenated.
    pub async fn read_line(&self) -> Result<String, ProcedureError> {
        Ok(self.read_item().await?.text())
    }

    /// Send a text message to the counterpart.
    pub async fn write_line(&self, text: impl Into<String>) -> Result<(), ProcedureError> {
        self.write_object(vec![ContentItem::plain(text)]).await
    }

    /// Send a content chain on the channel the conversation started on.
    pub async fn write_object(&self, chain: Vec<ContentItem>) -> Result<(), ProcedureError> {
        self.ensure_running()?;
        match self.init_message().sender() {
            Sender::Friend(user) => self.transport.send_to_user(user.id, &chain).await?,
            Sender::Group { group, .. } => self.transport.send_to_group(group.id, &chain).await?,
            Sender::Temp { member, group } => {
                self.transport
                    .send_to_temp(member.id, group.id, &chain)
                    .await?
            }
        }
        log::debug!(
            "procedure {}: sent {} item(s): {}",
            self.procedure.id(),
            chain.len(),
            chain_text(&chain)
        );
        Ok(())
    }

    /// Upload image bytes for this conversation's channel kind.
    pub async fn upload_image(&self, bytes: Vec<u8>) -> Result<ContentItem, ProcedureError> {
        self.ensure_running()?;
        let target = UploadTarget::from(self.source());
        Ok(self.transport.upload_image(bytes, target).await?)
    }

    /// Upload an image and send it.
    pub async fn write_image(&self, bytes: Vec<u8>) -> Result<(), ProcedureError> {
        let image = self.upload_image(bytes).await?;
        self.write_object(vec![image]).await
    }

    fn ensure_running(&self) -> Result<(), ProcedureError> {
        if self.procedure.is_finished() {
            Err(ProcedureError::Finished)
        } else {
            Ok(())
        }
    }
}

/// Marks the procedure finished when the task ends, including by panic.
struct FinishGuard(Arc<Procedure>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

/// Run the conversation body on its own task. Called once per procedure, by the dispatcher.
pub(crate) fn run_main(
    conversation: Box<dyn Conversation>,
    ctx: ProcedureContext,
) -> JoinHandle<()> {
    let procedure = Arc::clone(ctx.procedure());
    tokio::spawn(async move {
        let guard = FinishGuard(procedure);
        match conversation.run(ctx).await {
            Ok(()) => log::info!("procedure {}: finished", guard.0.id()),
            Err(e) => log::warn!("procedure {}: conversation failed: {:#}", guard.0.id(), e),
        }
    })
}
