//! Shared fixtures: a recording `AudioOutput` and station builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tuner_proto::output::{AudioOutput, OutputEvent, OutputNotice, Ticket};
use tuner_proto::station::Station;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Assign(Ticket, String),
    Start(Ticket),
    RequestStop,
    ResetPosition,
    Detach,
    Level(f32),
    Release,
}

/// Records every call so tests can assert on what reached the output and
/// replay lifecycle notices for the tickets it was given.
#[derive(Clone, Default)]
pub struct FakeOutput {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Ticket passed to the most recent `start`.
    pub fn last_start(&self) -> Ticket {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::Start(t) => Some(t),
                _ => None,
            })
            .expect("no start call recorded")
    }

    pub fn last_level(&self) -> Option<f32> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Level(l) => Some(l),
            _ => None,
        })
    }

    pub fn assigns(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Assign(_, url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl AudioOutput for FakeOutput {
    fn assign(&mut self, ticket: &Ticket, url: &str) {
        self.push(Call::Assign(ticket.clone(), url.to_string()));
    }

    fn start(&mut self, ticket: &Ticket) {
        self.push(Call::Start(ticket.clone()));
    }

    fn request_stop(&mut self) {
        self.push(Call::RequestStop);
    }

    fn reset_position(&mut self) {
        self.push(Call::ResetPosition);
    }

    fn detach(&mut self) {
        self.push(Call::Detach);
    }

    fn set_level(&mut self, level: f32) {
        self.push(Call::Level(level));
    }

    fn release(&mut self) {
        self.push(Call::Release);
    }
}

pub fn station(id: &str) -> Station {
    Station {
        id: id.into(),
        name: format!("Radio {}", id.to_uppercase()),
        genre: "Variety".into(),
        stream_url: format!("https://streams.example.com/{id}"),
        ..Station::default()
    }
}

pub fn catalog(ids: &[&str]) -> Vec<Station> {
    ids.iter().map(|id| station(id)).collect()
}

pub fn notice(ticket: &Ticket, event: OutputEvent) -> OutputNotice {
    OutputNotice::new(ticket.clone(), event)
}
