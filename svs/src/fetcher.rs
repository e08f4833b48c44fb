//! A cooperative request pipeline with bounded concurrency.
//!
//! Requests queue up and at most [`WINDOW_SIZE`] are in flight at once.
//! Timeouts retry with a fresh nonce, nacks surface immediately, and data is
//! run through the configured validator before it reaches the caller.
//! Dropping the [`Fetcher`] cancels everything in flight.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error_span, trace, Instrument};

use crate::face::{ExpressError, Face};
use crate::packet::{Data, Interest, NackReason};
use crate::security::{SecurityOptions, Validator};

/// Maximum number of in-flight interests.
pub const WINDOW_SIZE: usize = 10;

pub type DataCallback = Box<dyn FnOnce(Data) + Send + 'static>;
pub type NackCallback = Box<dyn FnOnce(Interest, NackReason) + Send + 'static>;
pub type TimeoutCallback = Box<dyn FnOnce(Interest) + Send + 'static>;
pub type ValidationFailCallback = Box<dyn FnOnce(Data) + Send + 'static>;

/// One request through the pipeline.
pub struct FetchRequest {
    interest: Interest,
    on_data: DataCallback,
    on_nack: Option<NackCallback>,
    on_timeout: Option<TimeoutCallback>,
    on_validation_fail: Option<ValidationFailCallback>,
    retries: u32,
    validation_retries: u32,
}

impl FetchRequest {
    pub fn new(interest: Interest, on_data: impl FnOnce(Data) + Send + 'static) -> Self {
        Self {
            interest,
            on_data: Box::new(on_data),
            on_nack: None,
            on_timeout: None,
            on_validation_fail: None,
            retries: 0,
            validation_retries: 0,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn on_nack(mut self, cb: impl FnOnce(Interest, NackReason) + Send + 'static) -> Self {
        self.on_nack = Some(Box::new(cb));
        self
    }

    pub fn on_timeout(mut self, cb: impl FnOnce(Interest) + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(cb));
        self
    }

    pub fn on_validation_fail(mut self, cb: impl FnOnce(Data) + Send + 'static) -> Self {
        self.on_validation_fail = Some(Box::new(cb));
        self
    }
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("interest", &self.interest.name())
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// Handle to the pipeline. Cheap to clone; the pipeline shuts down when the
/// last clone is dropped.
#[derive(Debug, Clone)]
pub struct Fetcher {
    to_actor: mpsc::UnboundedSender<FetchRequest>,
}

impl Fetcher {
    pub fn new(face: Arc<dyn Face>, security: &SecurityOptions) -> Self {
        let (to_actor, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            face,
            validator: security.validator.clone(),
            validation_retries: security.n_retries_on_validation_fail,
            validation_retry_delay: security.retry_delay_on_validation_fail,
            rx,
            queue: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            delayed: FuturesUnordered::new(),
        };
        tokio::spawn(actor.run().instrument(error_span!("fetcher")));
        Self { to_actor }
    }

    /// Enqueue a request. The pipeline keeps at most [`WINDOW_SIZE`] in
    /// flight.
    pub fn express(&self, request: FetchRequest) {
        // Failure means the actor is gone because every handle was dropped;
        // then there is nobody left to call back either.
        let _ = self.to_actor.send(request);
    }
}

type InFlight = BoxFuture<'static, (FetchRequest, Result<Data, ExpressError>)>;
type Delayed = BoxFuture<'static, FetchRequest>;

struct Actor {
    face: Arc<dyn Face>,
    validator: Option<Arc<dyn Validator>>,
    validation_retries: u32,
    validation_retry_delay: std::time::Duration,
    rx: mpsc::UnboundedReceiver<FetchRequest>,
    queue: VecDeque<FetchRequest>,
    in_flight: FuturesUnordered<InFlight>,
    delayed: FuturesUnordered<Delayed>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            self.fill_window();
            tokio::select! {
                biased;
                request = self.rx.recv() => {
                    match request {
                        Some(mut request) => {
                            request.validation_retries = self.validation_retries;
                            trace!(name = %request.interest.name(), "enqueue");
                            self.queue.push_back(request);
                        }
                        None => {
                            debug!("all fetcher handles dropped, stopping");
                            break;
                        }
                    }
                }
                Some(request) = self.delayed.next(), if !self.delayed.is_empty() => {
                    self.queue.push_back(request);
                }
                Some((request, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_complete(request, result);
                }
            }
        }
    }

    fn fill_window(&mut self) {
        while self.in_flight.len() < WINDOW_SIZE {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            let pending = self.face.express(request.interest.clone());
            self.in_flight
                .push(async move { (request, pending.await) }.boxed());
        }
    }

    fn on_complete(&mut self, mut request: FetchRequest, result: Result<Data, ExpressError>) {
        match result {
            Ok(data) => {
                let valid = self
                    .validator
                    .as_ref()
                    .map_or(true, |v| v.verify_data(&data));
                if valid {
                    (request.on_data)(data);
                } else if request.validation_retries > 0 {
                    request.validation_retries -= 1;
                    request.interest.refresh_nonce();
                    trace!(name = %request.interest.name(), "validation failed, retrying");
                    let delay = self.validation_retry_delay;
                    self.delayed.push(
                        async move {
                            tokio::time::sleep(delay).await;
                            request
                        }
                        .boxed(),
                    );
                } else {
                    debug!(name = %data.name(), "validation failed");
                    if let Some(cb) = request.on_validation_fail {
                        cb(data);
                    }
                }
            }
            Err(ExpressError::Nack(reason)) => {
                debug!(name = %request.interest.name(), %reason, "nacked");
                if let Some(cb) = request.on_nack {
                    cb(request.interest, reason);
                }
            }
            Err(ExpressError::Timeout) | Err(ExpressError::Closed) => {
                if request.retries > 0 {
                    request.retries -= 1;
                    request.interest.refresh_nonce();
                    trace!(name = %request.interest.name(), left = request.retries, "timeout, retrying");
                    self.queue.push_back(request);
                } else {
                    debug!(name = %request.interest.name(), "timed out");
                    if let Some(cb) = request.on_timeout {
                        cb(request.interest);
                    }
                }
            }
        }
    }
}
