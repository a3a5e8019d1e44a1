use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::result::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::retry::{Attempts, RetryPolicy, Verdict};

struct Entry<Request, Response, Error> {
    request: Request,
    attempts: Attempts,
    sender: oneshot::Sender<Result<Response, Error>>,
}

type Entries<Id, Request, Response, Error> = HashMap<Id, Entry<Request, Response, Error>>;

/// Maintains a mapping from request IDs to the requests awaiting a response, and the channels on
/// which to deliver that response.
///
/// Requests that go unanswered for longer than the policy's timeout are handed back by `sweep` to
/// be retransmitted, until the policy's retries are exhausted and the waiter is sent an error.
pub struct Correlator<Id, Request, Response, Error> {
    map: Arc<Mutex<Entries<Id, Request, Response, Error>>>,
    policy: RetryPolicy,
}

impl<Id, Request, Response, Error> Correlator<Id, Request, Response, Error>
where
    Id: Clone + Eq + Hash,
    Request: Clone,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            map: Default::default(),
            policy,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries<Id, Request, Response, Error>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Registers a request that was transmitted at `now`.
    pub fn register(
        &self,
        id: Id,
        request: Request,
        sender: oneshot::Sender<Result<Response, Error>>,
        now: Instant,
    ) {
        let entry = Entry {
            request,
            attempts: Attempts::sent(now),
            sender,
        };
        self.entries().insert(id, entry);
    }

    pub fn deregister(&self, id: &Id) -> Option<oneshot::Sender<Result<Response, Error>>> {
        self.entries().remove(id).map(|entry| entry.sender)
    }

    /// Delivers a result to whoever is awaiting `id`. Returns the result if nobody was.
    pub fn resolve(
        &self,
        id: &Id,
        result: Result<Response, Error>,
    ) -> Option<Result<Response, Error>> {
        match self.deregister(id) {
            Some(sender) => {
                let _ = sender.send(result);
                None
            }
            None => Some(result),
        }
    }

    pub fn resolve_success(&self, id: &Id, response: Response) -> Option<Response> {
        match self.resolve(id, Ok(response)) {
            Some(Ok(response)) => Some(response),
            _ => None,
        }
    }

    /// Returns the requests that are due for retransmission at `now`, marking them as sent.
    ///
    /// Requests for which `keep` returns false, or whose retries are exhausted, are removed and
    /// their waiters sent the error produced by `expired`.
    pub fn sweep<K, E>(&self, now: Instant, mut keep: K, mut expired: E) -> Vec<(Id, Request)>
    where
        K: FnMut(&Request) -> bool,
        E: FnMut(&Id) -> Error,
    {
        let mut entries = self.entries();
        let mut resend = Vec::new();
        let mut dropped = Vec::new();

        for (id, entry) in entries.iter_mut() {
            match entry.attempts.verdict(&self.policy, now) {
                Verdict::Wait => {}
                _ if !keep(&entry.request) => dropped.push(id.clone()),
                Verdict::Send | Verdict::Resend => {
                    entry.attempts.mark_sent(now);
                    resend.push((id.clone(), entry.request.clone()));
                }
                Verdict::Exhausted => dropped.push(id.clone()),
            }
        }

        for id in dropped {
            if let Some(entry) = entries.remove(&id) {
                let _ = entry.sender.send(Err(expired(&id)));
            }
        }

        resend
    }

    /// Removes every request, sending each waiter the error produced by `expired`.
    pub fn expire_all<E>(&self, mut expired: E)
    where
        E: FnMut(&Id) -> Error,
    {
        for (id, entry) in self.entries().drain() {
            let _ = entry.sender.send(Err(expired(&id)));
        }
    }

    /// Registers `id` while `future` transmits the request, forwarding any transmission error to
    /// the waiter.
    pub async fn register_while<F, R, E>(
        self,
        id: Id,
        request: Request,
        sender: oneshot::Sender<Result<Response, Error>>,
        future: F,
    ) where
        F: Future<Output = Result<R, E>>,
        E: Into<Error>,
    {
        self.register(id.clone(), request, sender, Instant::now());
        let future = future.map(move |result| {
            if let Err(error) = result {
                self.resolve(&id, Err(error.into()));
            }
        });
        future.await;
    }
}

impl<Id, Request, Response, Error> Clone for Correlator<Id, Request, Response, Error> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            policy: self.policy,
        }
    }
}
