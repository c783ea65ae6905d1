//! Dispatcher: routes every inbound message to the live procedure it belongs to, or asks the
//! factory for a new one.
//!
//! Each routing decision holds the registry lock for the whole scan / reclaim / register step, so
//! two messages from a new counterpart cannot both start a procedure. A new procedure is in the
//! registry (with the triggering message already queued) before its task is spawned.

use crate::message::Message;
use crate::procedure::{self, Conversation, Procedure, ProcedureContext};
use crate::registry::ProcedureRegistry;
use crate::transport::{Transport, TransportError, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Decides whether an unmatched message starts a conversation. Called with the registry locked;
/// must not block.
pub type ProcedureFactory =
    dyn Fn(&Message, &Arc<dyn Transport>) -> Option<Box<dyn Conversation>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher already started")]
    AlreadyStarted,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued into a running procedure.
    Delivered { procedure_id: String },
    /// Started a new procedure with this message as its first inbox item.
    Started { procedure_id: String },
    /// No procedure matched and the factory declined.
    Ignored,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    factory: Box<ProcedureFactory>,
    registry: Arc<ProcedureRegistry>,
    idle_timeout: Option<Duration>,
    started: AtomicBool,
}

impl Dispatcher {
    pub fn new<F>(transport: Arc<dyn Transport>, factory: F) -> Self
    where
        F: Fn(&Message, &Arc<dyn Transport>) -> Option<Box<dyn Conversation>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            transport,
            factory: Box::new(factory),
            registry: Arc::new(ProcedureRegistry::new()),
            idle_timeout: None,
            started: AtomicBool::new(false),
        }
    }

    /// Use a caller-owned live set instead of a private one.
    pub fn with_registry(mut self, registry: Arc<ProcedureRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Abort procedures that wait longer than `timeout` for their next message.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ProcedureRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Subscribe to the transport's events and route them on a background task.
    /// Only one subscription per dispatcher; a second call fails with `AlreadyStarted`.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, DispatchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyStarted);
        }
        let mut events = match self.transport.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        log::info!("dispatcher: subscribed to {} events", self.transport.id());
        let dispatcher = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // Routed on its own task: a panicking factory loses only this event.
                let routing = Arc::clone(&dispatcher);
                let routed = tokio::spawn(async move { routing.handle_event(event).await }).await;
                if let Err(e) = routed {
                    log::warn!("dispatcher: routing an event failed: {}", e);
                }
            }
            log::info!("dispatcher: event stream closed");
        }))
    }

    /// Normalize a raw transport event and route it.
    pub async fn handle_event(&self, event: TransportEvent) -> Dispatch {
        self.handle_message(event.into_message()).await
    }

    /// Route one message: reclaim finished procedures, deliver to the matching one, or start a new one.
    pub async fn handle_message(&self, message: Message) -> Dispatch {
        let mut live = self.registry.lock().await;

        let mut hit: Option<Arc<Procedure>> = None;
        live.retain(|p| {
            if p.is_finished() {
                log::debug!("dispatcher: reclaimed procedure {}", p.id());
                return false;
            }
            if hit.is_none() && p.is_my_msg(&message) {
                hit = Some(Arc::clone(p));
            }
            true
        });

        if let Some(procedure) = hit {
            let procedure_id = procedure.id().to_string();
            if !procedure.recv_msg(message) {
                log::debug!(
                    "dispatcher: procedure {} finished before delivery, message dropped",
                    procedure_id
                );
            }
            return Dispatch::Delivered { procedure_id };
        }

        let Some(conversation) = (self.factory)(&message, &self.transport) else {
            log::debug!(
                "dispatcher: no procedure for {:?} message from {}",
                message.source(),
                message.sender().user_id()
            );
            return Dispatch::Ignored;
        };

        let procedure = Arc::new(Procedure::new(message));
        let procedure_id = procedure.id().to_string();
        live.push(Arc::clone(&procedure));
        log::info!(
            "dispatcher: started procedure {} for {:?} {} (live: {})",
            procedure_id,
            procedure.source(),
            procedure.init_message().sender().user_id(),
            live.len()
        );
        let ctx = ProcedureContext::new(procedure, Arc::clone(&self.transport), self.idle_timeout);
        drop(procedure::run_main(conversation, ctx));
        Dispatch::Started { procedure_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::conversation_fn;
    use crate::transport::MemoryTransport;

    fn waiting_conversation() -> Box<dyn Conversation> {
        conversation_fn(|ctx: ProcedureContext| async move {
            while ctx.read_item().await.is_ok() {}
            Ok(())
        })
    }

    fn dispatcher(transport: Arc<MemoryTransport>) -> Dispatcher {
        Dispatcher::new(transport, |msg: &Message, _: &Arc<dyn Transport>| {
            (msg.text() == "start").then(waiting_conversation)
        })
    }

    #[tokio::test]
    async fn factory_veto_creates_nothing() {
        let d = dispatcher(Arc::new(MemoryTransport::new()));
        assert_eq!(
            d.handle_message(Message::friend_text(1, "hello")).await,
            Dispatch::Ignored
        );
        assert!(d.registry().is_empty().await);
    }

    #[tokio::test]
    async fn same_identity_twice_starts_one_procedure() {
        let d = dispatcher(Arc::new(MemoryTransport::new()));
        let first = d.handle_message(Message::friend_text(1, "start")).await;
        let second = d.handle_message(Message::friend_text(1, "start")).await;
        let procedure_id = match first {
            Dispatch::Started { procedure_id } => procedure_id,
            other => panic!("expected start, got {:?}", other),
        };
        assert_eq!(second, Dispatch::Delivered { procedure_id });
        assert_eq!(d.registry().len().await, 1);
    }

    #[tokio::test]
    async fn reclaims_finished_on_any_event() {
        let d = dispatcher(Arc::new(MemoryTransport::new()));
        d.handle_message(Message::friend_text(1, "start")).await;
        d.handle_message(Message::group_text(7, 2, "start")).await;
        for p in d.registry().snapshot().await {
            p.abort().expect("abort");
        }
        assert_eq!(d.registry().len().await, 2);
        assert_eq!(
            d.handle_message(Message::friend_text(3, "unrelated")).await,
            Dispatch::Ignored
        );
        assert!(d.registry().is_empty().await);
    }

    #[tokio::test]
    async fn start_subscribes_once() {
        let d = Arc::new(dispatcher(Arc::new(MemoryTransport::new())));
        let handle = d.start().await.expect("start");
        assert!(matches!(d.start().await, Err(DispatchError::AlreadyStarted)));
        handle.abort();
    }

    #[tokio::test]
    async fn failed_subscribe_does_not_mark_started() {
        let transport = Arc::new(MemoryTransport::new());
        let _taken = transport.subscribe().await.expect("first subscriber");
        let d = Arc::new(dispatcher(transport));
        for _ in 0..2 {
            assert!(matches!(
                d.start().await,
                Err(DispatchError::Transport(TransportError::AlreadySubscribed))
            ));
        }
    }

    #[tokio::test]
    async fn factory_receives_the_dispatcher_transport() {
        let transport = Arc::new(MemoryTransport::new());
        let d = Dispatcher::new(transport, |msg: &Message, transport: &Arc<dyn Transport>| {
            (transport.id() == "memory" && msg.text() == "start").then(waiting_conversation)
        });
        assert_eq!(d.transport().id(), "memory");
        assert!(matches!(
            d.handle_message(Message::friend_text(1, "start")).await,
            Dispatch::Started { .. }
        ));
    }

    #[tokio::test]
    async fn shared_registry_is_visible_to_caller() {
        let registry = Arc::new(ProcedureRegistry::new());
        let d = dispatcher(Arc::new(MemoryTransport::new())).with_registry(Arc::clone(&registry));
        d.handle_message(Message::temp_text(4, 1, "start")).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry
            .find_match(&Message::temp_text(4, 1, "x"))
            .await
            .is_some());
    }
}
