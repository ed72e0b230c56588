//! Call batching: queue calls locally, send them in one BATCH message and
//! get every outcome back in a single reply.

use super::{Bound, Outgoing, Proxy};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::slice;
use tether_codec::{CallBody, Outcome, Payload, Value};

struct QueuedCall {
    method: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

/// Calls queued against one proxy
pub struct Batch<'a> {
    proxy: &'a Proxy,
    calls: Vec<QueuedCall>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(proxy: &'a Proxy) -> Self {
        Self {
            proxy,
            calls: Vec::new(),
        }
    }

    /// Queue a call; returns its index in the results
    pub fn add(&mut self, method: &str, args: Vec<Value>) -> usize {
        self.add_with(method, args, BTreeMap::new())
    }

    pub fn add_with(&mut self, method: &str, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> usize {
        self.calls.push(QueuedCall {
            method: method.to_string(),
            args,
            kwargs,
        });
        self.calls.len() - 1
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Send the batch and wait for all outcomes
    pub async fn execute(self) -> Result<BatchResults> {
        let reply = self
            .send(false)
            .await?
            .ok_or_else(|| Error::protocol("no reply to a batch"))?;
        match reply.payload {
            Payload::Outcomes(outcomes) if reply.message.flags.batch => {
                Ok(BatchResults::new(outcomes, self.calls.len()))
            }
            other => Err(Error::protocol(format!(
                "unexpected {} payload in batch reply",
                other.kind()
            ))),
        }
    }

    /// Send the batch without waiting for outcomes
    pub async fn execute_oneway(self) -> Result<()> {
        self.send(true).await.map(|_| ())
    }

    async fn send(&self, oneway: bool) -> Result<Option<super::Exchange>> {
        if self.calls.is_empty() {
            return Err(Error::usage("cannot execute an empty batch"));
        }
        self.proxy
            .exchange(|bound: &Bound<'_>| {
                let calls = self
                    .calls
                    .iter()
                    .map(|call| CallBody {
                        object_id: bound.object_id.to_string(),
                        method: call.method.clone(),
                        args: call.args.clone(),
                        kwargs: call.kwargs.clone(),
                    })
                    .collect();
                Ok(Outgoing::batch(calls, oneway))
            })
            .await
    }
}

/// Outcomes of an executed batch, in call order. Processing stops at the
/// first failing call, so there may be fewer outcomes than queued calls.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResults {
    results: Vec<Result<Value>>,
    submitted: usize,
}

impl BatchResults {
    fn new(outcomes: Vec<Outcome>, submitted: usize) -> Self {
        let results = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Outcome::Ok(value) => Ok(value),
                Outcome::Err(envelope) => Err(Error::from_envelope(envelope)),
            })
            .collect();
        Self { results, submitted }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of calls that were queued
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Whether every queued call ran
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.submitted
    }

    pub fn get(&self, index: usize) -> Option<&Result<Value>> {
        self.results.get(index)
    }

    /// Iterate outcomes; may be called any number of times
    pub fn iter(&self) -> slice::Iter<'_, Result<Value>> {
        self.results.iter()
    }

    /// All values, or the first error
    pub fn into_values(self) -> Result<Vec<Value>> {
        self.results.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a BatchResults {
    type Item = &'a Result<Value>;
    type IntoIter = slice::Iter<'a, Result<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

impl IntoIterator for BatchResults {
    type Item = Result<Value>;
    type IntoIter = std::vec::IntoIter<Result<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
