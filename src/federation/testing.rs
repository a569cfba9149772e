//! Scripted source used by the federation unit tests

#![cfg(test)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{Metacard, QueryRequest, ResultEntry, Source, SourceResponse};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    Respond,
    Fail(String),
    Unsupported(String),
    Unavailable,
    Hang,
}

/// Source answering with fixed relevance-scored results after an optional delay
pub(crate) struct ScriptedSource {
    id: String,
    scores: Vec<f64>,
    delay: Duration,
    behaviour: Behaviour,
    calls: AtomicUsize,
    last_request: Mutex<Option<QueryRequest>>,
}

impl ScriptedSource {
    pub(crate) fn new(id: &str, scores: &[f64]) -> Self {
        Self {
            id: id.to_string(),
            scores: scores.to_vec(),
            delay: Duration::ZERO,
            behaviour: Behaviour::Respond,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<QueryRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        !matches!(self.behaviour, Behaviour::Unavailable)
    }

    async fn query(&self, request: &QueryRequest) -> Result<SourceResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behaviour {
            Behaviour::Respond | Behaviour::Unavailable => {}
            Behaviour::Fail(reason) => {
                return Err(Error::SourceExecution {
                    source_id: self.id.clone(),
                    reason: reason.clone(),
                })
            }
            Behaviour::Unsupported(reason) => {
                return Err(Error::UnsupportedQuery {
                    source_id: self.id.clone(),
                    reason: reason.clone(),
                })
            }
            Behaviour::Hang => std::future::pending::<()>().await,
        }

        let mut results: Vec<ResultEntry> = self
            .scores
            .iter()
            .enumerate()
            .map(|(i, score)| {
                ResultEntry::new(Metacard::new(format!("{}-{}", self.id, i), self.id.clone()))
                    .with_relevance(*score)
            })
            .collect();
        let hits = results.len() as u64;

        let query = request.query();
        let skip = query.start_index().saturating_sub(1);
        results = results.into_iter().skip(skip).collect();
        if query.page_size() > 0 {
            results.truncate(query.page_size());
        }

        Ok(SourceResponse::new(self.id.clone(), results, hits))
    }
}
