/*
 * Handlers are the in-process consumers of events. Each has an id (the
 * address it reads as), a set of subscriptions and a few callbacks. The
 * router's thread calls them, so callbacks must be Send, and a callback must
 * not lock its own handler again.
 */
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::filter::{CheckContext, Filter, FilterSet};
use crate::process_record::ProcessRecord;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};

pub type EventFn = Box<dyn FnMut(&Event) + Send>;
pub type EventListFn = Box<dyn FnMut(&[Event]) + Send>;
pub type ProcessFn = Box<dyn FnMut(&ProcessRecord) + Send>;

pub struct EventHandler {
    id: String,
    subscriptions: FilterSet,
    incoming: Option<EventFn>,
    incoming_list: Option<EventListFn>,
    remove: Option<EventFn>,
    remove_list: Option<EventListFn>,
    attach: Option<ProcessFn>,
    detach: Option<ProcessFn>,
}

impl EventHandler {
    pub fn new(id: &str) -> EventHandler {
        return EventHandler {
            id: id.to_string(),
            subscriptions: FilterSet::new(),
            incoming: None,
            incoming_list: None,
            remove: None,
            remove_list: None,
            attach: None,
            detach: None,
        };
    }

    pub fn id(&self) -> &str {
        return &self.id;
    }

    pub fn subscriptions(&self) -> &FilterSet {
        return &self.subscriptions;
    }

    pub fn subscriptions_mut(&mut self) -> &mut FilterSet {
        return &mut self.subscriptions;
    }

    /// Called once per delivered event.
    pub fn set_incoming_func(&mut self, f: impl FnMut(&Event) + Send + 'static) {
        self.incoming = Some(Box::new(f));
    }

    /// Called with the whole batch, before the per event callback.
    pub fn set_incoming_list_func(&mut self, f: impl FnMut(&[Event]) + Send + 'static) {
        self.incoming_list = Some(Box::new(f));
    }

    /// Called for each event maintenance is about to remove.
    pub fn set_remove_func(&mut self, f: impl FnMut(&Event) + Send + 'static) {
        self.remove = Some(Box::new(f));
    }

    pub fn set_remove_list_func(&mut self, f: impl FnMut(&[Event]) + Send + 'static) {
        self.remove_list = Some(Box::new(f));
    }

    pub fn set_attach_process_func(&mut self, f: impl FnMut(&ProcessRecord) + Send + 'static) {
        self.attach = Some(Box::new(f));
    }

    pub fn set_detach_process_func(&mut self, f: impl FnMut(&ProcessRecord) + Send + 'static) {
        self.detach = Some(Box::new(f));
    }

    pub fn add_filter(&mut self, filter: Filter) {
        self.subscriptions.add_filter(filter);
    }

    pub fn add_key(&mut self, key: u64) {
        self.subscriptions.add_key(key);
    }

    pub fn add_topic(&mut self, topic: &str) -> Result<()> {
        return self.subscriptions.add_topic(topic);
    }

    pub fn add_to(&mut self, to: &str) -> Result<()> {
        return self.subscriptions.add_to(to);
    }

    pub fn add_from(&mut self, from: &str) -> Result<()> {
        return self.subscriptions.add_from(from);
    }

    pub fn add_payload(&mut self, payload: &str) -> Result<()> {
        return self.subscriptions.add_payload(payload);
    }

    pub fn add_event_type(&mut self, kind: i32) {
        self.subscriptions.add_event_type(kind);
    }

    pub fn add_kind(&mut self, kind: EventKind) {
        self.subscriptions.add_kind(kind);
    }

    pub fn add_pending_events(&mut self, id: &str) -> Result<()> {
        return self.subscriptions.add_pending_events(id);
    }

    pub fn add_pending_maintenance_events(&mut self) {
        self.subscriptions.add_pending_maintenance_events();
    }

    /// Events for this handler: addressed to it or matching one of its
    /// subscriptions, and not yet read by it. Without subscriptions only
    /// direct mail is delivered.
    pub fn wants(&self, event: &Event, ctx: &CheckContext) -> bool {
        if event.is_read_by(&self.id, ctx.now, ctx.login_at) {
            return false;
        }
        let addressed = event.to_field().eq_ignore_case(&self.id);
        return addressed
            || (!self.subscriptions.is_empty() && self.subscriptions.check_at(event, ctx));
    }

    pub(crate) fn deliver(&mut self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        debug!("handler {}: delivering {} events", self.id, events.len());
        if let Some(f) = self.incoming_list.as_mut() {
            f(events);
        }
        if let Some(f) = self.incoming.as_mut() {
            for event in events {
                f(event);
            }
        }
    }

    pub(crate) fn post_remove(&mut self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        if let Some(f) = self.remove_list.as_mut() {
            f(events);
        }
        if let Some(f) = self.remove.as_mut() {
            for event in events {
                f(event);
            }
        }
    }

    pub(crate) fn attached(&mut self, process: &ProcessRecord) {
        if let Some(f) = self.attach.as_mut() {
            f(process);
        }
    }

    pub(crate) fn detached(&mut self, process: &ProcessRecord) {
        if let Some(f) = self.detach.as_mut() {
            f(process);
        }
    }
}

pub type SharedHandler = Arc<Mutex<EventHandler>>;

/// The handlers of one router.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<Mutex<Vec<SharedHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, handler: EventHandler) -> EventHandlerHandle {
        let handler = Arc::new(Mutex::new(handler));
        self.handlers.lock().push(handler.clone());
        return EventHandlerHandle {
            handler,
            registry: Arc::downgrade(&self.handlers),
        };
    }

    /// Current handlers, without holding the registry lock while calling
    /// into them.
    pub fn snapshot(&self) -> Vec<SharedHandler> {
        return self.handlers.lock().clone();
    }

    pub fn len(&self) -> usize {
        return self.handlers.lock().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Union of all subscriptions plus direct mail for every handler id.
    pub fn subscriptions(&self) -> FilterSet {
        let mut set = FilterSet::new();
        for handler in self.snapshot() {
            let handler = handler.lock();
            set.append(handler.subscriptions());
        }
        return set;
    }

    pub fn ids(&self) -> Vec<String> {
        return self
            .snapshot()
            .iter()
            .map(|h| h.lock().id().to_string())
            .collect();
    }
}

/// Keeps a handler registered, dropping it deregisters the handler.
pub struct EventHandlerHandle {
    handler: SharedHandler,
    registry: Weak<Mutex<Vec<SharedHandler>>>,
}

impl EventHandlerHandle {
    pub fn lock(&self) -> MutexGuard<'_, EventHandler> {
        return self.handler.lock();
    }

    pub fn id(&self) -> String {
        return self.handler.lock().id().to_string();
    }
}

impl Drop for EventHandlerHandle {
    fn drop(&mut self) {
        if let Some(handlers) = self.registry.upgrade() {
            handlers
                .lock()
                .retain(|h| !Arc::ptr_eq(h, &self.handler));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_vector::Record;
    use crate::utils::now_micros;

    #[test]
    fn list_callback_runs_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handler = EventHandler::new("X");
        {
            let order = order.clone();
            handler.set_incoming_list_func(move |events| {
                order.lock().push(format!("list {}", events.len()))
            });
        }
        {
            let order = order.clone();
            handler.set_incoming_func(move |e| order.lock().push(format!("one {}", e.key())));
        }

        let mut a = Event::new("t", "X", "A", EventKind::Generic);
        a.set_key(1);
        let mut b = a;
        b.set_key(2);
        handler.deliver(&[a, b]);
        assert_eq!(*order.lock(), vec!["list 2", "one 1", "one 2"]);
    }

    #[test]
    fn wants_direct_mail_and_subscriptions() {
        let ctx = CheckContext::now();
        let mut handler = EventHandler::new("X");
        let direct = Event::new("t", "x", "A", EventKind::Generic);
        let other = Event::new("news", "Y", "A", EventKind::Generic);
        assert!(handler.wants(&direct, &ctx));
        assert!(!handler.wants(&other, &ctx));

        handler.add_topic("news").unwrap();
        assert!(handler.wants(&other, &ctx));

        let mut read = direct;
        read.mark_read_by("X", now_micros());
        assert!(!handler.wants(&read, &ctx));
    }

    #[test]
    fn dropping_the_handle_deregisters() {
        let registry = HandlerRegistry::default();
        let a = registry.register(EventHandler::new("a"));
        let b = registry.register(EventHandler::new("b"));
        a.lock().add_topic("news").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.subscriptions().len(), 1);
        drop(a);
        assert_eq!(registry.ids(), vec!["b".to_string()]);
        drop(b);
        assert!(registry.is_empty());
    }
}
