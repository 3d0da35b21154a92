//! In-process gateway for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use dripcast_core::traits::Gateway;
use dripcast_core::types::{ChatId, Content, DeliveryError, DeliveryOptions};
use tokio::time::Instant;

/// Replays queued outcomes per recipient; unscripted calls succeed.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<HashMap<ChatId, VecDeque<Result<(), DeliveryError>>>>,
    always: Mutex<HashMap<ChatId, DeliveryError>>,
    calls: Mutex<Vec<(ChatId, Content)>>,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive calls to `chat_id`.
    pub fn script(&self, chat_id: ChatId, outcomes: Vec<Result<(), DeliveryError>>) {
        self.script
            .lock()
            .unwrap()
            .entry(chat_id)
            .or_default()
            .extend(outcomes);
    }

    /// Every call to `chat_id` fails with `error` once the script is drained.
    pub fn always_fail(&self, chat_id: ChatId, error: DeliveryError) {
        self.always.lock().unwrap().insert(chat_id, error);
    }

    pub fn calls(&self) -> Vec<(ChatId, Content)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, chat_id: ChatId) -> usize {
        self.calls.lock().unwrap().iter().filter(|(id, _)| *id == chat_id).count()
    }

    /// Sizes of runs of calls made at the same instant. Under a paused
    /// clock each broadcast batch is one run.
    pub fn bursts(&self) -> Vec<usize> {
        let times = self.call_times.lock().unwrap();
        let mut bursts: Vec<(Instant, usize)> = Vec::new();
        for at in times.iter() {
            match bursts.last_mut() {
                Some((last, n)) if last == at => *n += 1,
                _ => bursts.push((*at, 1)),
            }
        }
        bursts.into_iter().map(|(_, n)| n).collect()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn deliver(
        &self,
        chat_id: ChatId,
        content: &Content,
        _options: &DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push((chat_id, content.clone()));
        self.call_times.lock().unwrap().push(Instant::now());
        if let Some(next) = self
            .script
            .lock()
            .unwrap()
            .get_mut(&chat_id)
            .and_then(|q| q.pop_front())
        {
            return next;
        }
        match self.always.lock().unwrap().get(&chat_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
