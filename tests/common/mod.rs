//! Scripted in-memory messaging surface for runner scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use bulk_courier::{
    BootstrapError, Element, Key, SessionBootstrap, SessionError, SessionHandle, Signal,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the surface reacts when a contact's chat is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Chat opens and every control is available
    Deliver,
    /// Invalid-number popup only
    Invalid,
    /// Chat never becomes usable
    Transient,
    /// Chat opens, attachment preview never gets a send button
    UploadStall,
}

/// Something the engine did to the surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Navigate(String),
    Click(String),
    Type(String),
    Keys(Key),
}

type NavigateHook = Box<dyn Fn(&str) + Send + Sync>;

/// Shared state behind every session the fake bootstrap hands out
pub struct FakeSurface {
    behaviors: HashMap<String, Behavior>,
    current: Mutex<Option<String>>,
    events: Mutex<Vec<Event>>,
    on_navigate: Mutex<Option<NavigateHook>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: bool,
    fail_auth: bool,
}

impl FakeSurface {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self::build(behaviors, false, false))
    }

    pub fn failing_open() -> Arc<Self> {
        Arc::new(Self::build(&[], true, false))
    }

    pub fn failing_auth() -> Arc<Self> {
        Arc::new(Self::build(&[], false, true))
    }

    fn build(behaviors: &[(&str, Behavior)], fail_open: bool, fail_auth: bool) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(c, b)| ((*c).to_string(), *b))
                .collect(),
            current: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            on_navigate: Mutex::new(None),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_open,
            fail_auth,
        }
    }

    /// Run `hook` whenever a chat is opened
    pub fn on_navigate(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_navigate.lock().expect("fake surface lock") = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("fake surface lock").clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Navigate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn clicks_on(&self, signal: Signal) -> usize {
        let id = element_id(signal);
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Click(c) if *c == id))
            .count()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn push(&self, event: Event) {
        self.events.lock().expect("fake surface lock").push(event);
    }

    fn present(&self, signal: Signal) -> bool {
        let current = self.current.lock().expect("fake surface lock").clone();
        let behavior = current
            .and_then(|c| self.behaviors.get(&c).copied())
            .unwrap_or(Behavior::Deliver);
        match behavior {
            Behavior::Deliver => signal != Signal::InvalidNumber,
            Behavior::Invalid => signal == Signal::InvalidNumber,
            Behavior::Transient => false,
            Behavior::UploadStall => {
                !matches!(signal, Signal::InvalidNumber | Signal::UploadSend)
            }
        }
    }
}

fn element_id(signal: Signal) -> String {
    format!("{signal:?}")
}

pub struct FakeSession {
    surface: Arc<FakeSurface>,
}

#[async_trait]
impl SessionHandle for FakeSession {
    async fn navigate(&self, contact: &str) -> Result<(), SessionError> {
        self.surface.push(Event::Navigate(contact.to_string()));
        *self.surface.current.lock().expect("fake surface lock") = Some(contact.to_string());
        let hook = self.surface.on_navigate.lock().expect("fake surface lock");
        if let Some(hook) = hook.as_ref() {
            hook(contact);
        }
        Ok(())
    }

    async fn wait_for_any(
        &self,
        signals: &[Signal],
        timeout: Duration,
    ) -> Result<Option<Signal>, SessionError> {
        if let Some(found) = signals.iter().copied().find(|s| self.surface.present(*s)) {
            return Ok(Some(found));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn wait_interactable(
        &self,
        signal: Signal,
        timeout: Duration,
    ) -> Result<Option<Element>, SessionError> {
        if self.surface.present(signal) {
            return Ok(Some(Element(element_id(signal))));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn find_all(&self, signal: Signal) -> Result<Vec<Element>, SessionError> {
        Ok(if self.surface.present(signal) {
            vec![Element(element_id(signal))]
        } else {
            Vec::new()
        })
    }

    async fn click(&self, element: &Element) -> Result<(), SessionError> {
        self.surface.push(Event::Click(element.id().to_string()));
        Ok(())
    }

    async fn type_text(&self, _element: &Element, text: &str) -> Result<(), SessionError> {
        self.surface.push(Event::Type(text.to_string()));
        Ok(())
    }

    async fn send_keys(&self, _element: &Element, key: Key) -> Result<(), SessionError> {
        self.surface.push(Event::Keys(key));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.surface.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeBootstrap {
    pub surface: Arc<FakeSurface>,
}

#[async_trait]
impl SessionBootstrap for FakeBootstrap {
    async fn open(&self) -> Result<Box<dyn SessionHandle>, BootstrapError> {
        if self.surface.fail_open {
            return Err(SessionError::Transport("chromedriver not reachable".into()).into());
        }
        self.surface.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            surface: Arc::clone(&self.surface),
        }))
    }

    async fn authenticate(&self, _session: &dyn SessionHandle, timeout: Duration) -> bool {
        if self.surface.fail_auth {
            tokio::time::sleep(timeout).await;
            return false;
        }
        true
    }
}
