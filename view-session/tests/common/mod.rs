//! Shared test doubles: a session factory that journals every lifecycle event.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use view_common::{Error, Result};
use view_session::{AppRegistry, FlushMode, Session, SessionFactory, SessionFactoryHandle};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Opened(String),
    Flushed(String),
    Closed { id: String, mode: FlushMode },
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Opened(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Closed { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn flushed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Flushed(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

pub struct RecordingFactory {
    journal: Journal,
    seq: AtomicUsize,
}

impl RecordingFactory {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            seq: AtomicUsize::new(0),
        }
    }
}

impl SessionFactory for RecordingFactory {
    fn name(&self) -> &str {
        "recording"
    }

    fn open_session(&self) -> Result<Box<dyn Session>> {
        let id = format!("rec-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        self.journal.push(Event::Opened(id.clone()));
        Ok(Box::new(RecordingSession {
            id,
            mode: FlushMode::Auto,
            open: true,
            journal: self.journal.clone(),
        }))
    }
}

pub struct RecordingSession {
    id: String,
    mode: FlushMode,
    open: bool,
    journal: Journal,
}

impl Session for RecordingSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn flush_mode(&self) -> FlushMode {
        self.mode
    }

    fn set_flush_mode(&mut self, mode: FlushMode) {
        self.mode = mode;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn flush(&mut self) -> Result<()> {
        self.journal.push(Event::Flushed(self.id.clone()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::Session(format!("{} closed twice", self.id)));
        }
        self.open = false;
        self.journal.push(Event::Closed {
            id: self.id.clone(),
            mode: self.mode,
        });
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registry holding a recording factory, plus the handle and its journal.
pub fn recording_registry() -> (Arc<AppRegistry>, SessionFactoryHandle, Journal) {
    let journal = Journal::default();
    let handle = SessionFactoryHandle::new(RecordingFactory::new(journal.clone()));
    let registry = Arc::new(AppRegistry::new());
    registry.register(handle.clone());
    (registry, handle, journal)
}
