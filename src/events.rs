//! Event bus (part of spec C9): named listener lists dispatched in
//! registration order, asynchronous listeners run as detached tasks,
//! synchronous listeners run inline, matching spec.md §4.9/§5.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::trace;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The events the application consumes, per spec.md §4.9.
#[derive(Debug, Clone)]
pub enum Event {
    InboundCall { from: SocketAddr },
    InboundCallAccepted,
    InboundCallEnded,
    VoiceConnectionFinalized,
    BotMention { user_id: String, channel_id: String },
    GuildJoin { guild_id: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::InboundCall { .. } => "inbound_call",
            Event::InboundCallAccepted => "inbound_call_accepted",
            Event::InboundCallEnded => "inbound_call_ended",
            Event::VoiceConnectionFinalized => "voice_connection_finalized",
            Event::BotMention { .. } => "bot_mention",
            Event::GuildJoin { .. } => "guild_join",
        }
    }
}

enum Listener {
    Sync(Box<dyn Fn(Event) + Send + Sync>),
    Async(Box<dyn Fn(Event) -> BoxFuture + Send + Sync>),
}

/// Maps event names to ordered listener lists (spec.md §4.9 "EventHandler").
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<&'static str, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sync(&self, name: &'static str, f: impl Fn(Event) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .push(Listener::Sync(Box::new(f)));
    }

    pub fn on_async<F, Fut>(&self, name: &'static str, f: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listeners
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .push(Listener::Async(Box::new(move |ev| Box::pin(f(ev)))));
    }

    /// Run every listener registered for `event.name()`, in
    /// registration order: synchronous listeners inline, asynchronous
    /// listeners as detached tasks.
    pub fn dispatch(&self, event: Event) {
        let name = event.name();
        let guard = self.listeners.lock().unwrap();
        let Some(listeners) = guard.get(name) else {
            trace!(event = name, "dispatch with no listeners");
            return;
        };
        for listener in listeners {
            match listener {
                Listener::Sync(f) => f(event.clone()),
                Listener::Async(f) => {
                    let fut = f(event.clone());
                    tokio::spawn(fut);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn sync_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.on_sync("guild_join", move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.on_sync("guild_join", move |_| o2.lock().unwrap().push(2));
        bus.dispatch(Event::GuildJoin { guild_id: "g".into() });
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn async_listener_runs_as_detached_task() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        bus.on_async("bot_mention", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.dispatch(Event::BotMention {
            user_id: "u".into(),
            channel_id: "c".into(),
        });
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
