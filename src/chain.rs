//! Stage composition.
//!
//! A [`Chain`] is an immutable, ordered list of [`Stage`]s. Calling
//! [`Chain::then`] with an endpoint yields one [`Handler`] that behaves like
//! nested scopes: code a stage runs before `next.run(cx)` executes in
//! registration order, code after it in reverse order.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    config::DEFAULT_BODY_LIMIT, context::RequestContext, error::ChainError, sink::RedactionSink,
};

/// Result of running a handler or stage.
pub type ChainResult = Result<(), ChainError>;

/// Anything that can serve a request context: an endpoint, or a whole chain.
pub trait Handler: Send + Sync {
    fn call<'a>(&'a self, cx: &'a mut RequestContext) -> BoxFuture<'a, ChainResult>;
}

/// One unit of request processing.
///
/// A stage receives the context and the rest of the chain. It may change the
/// context, must delegate through `next`, and may act once `next` returns.
pub trait Stage: Send + Sync {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult>;
}

/// The remainder of a chain: the stages not yet entered plus the endpoint.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    endpoint: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Runs the next stage, or the endpoint when no stage is left.
    pub fn run<'b>(self, cx: &'b mut RequestContext) -> BoxFuture<'b, ChainResult>
    where
        'a: 'b,
    {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.call(
                cx,
                Next {
                    stages: rest,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.call(cx),
        }
    }
}

/// Ordered, immutable sequence of stages.
#[derive(Clone)]
pub struct Chain {
    stages: Arc<[Arc<dyn Stage>]>,
    redaction_sink: Option<Arc<dyn RedactionSink>>,
    body_limit: usize,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            stages: Arc::from(Vec::new()),
            redaction_sink: None,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Returns a new chain with `stage` appended at the tail.
    pub fn append(&self, stage: impl Stage + 'static) -> Chain {
        let mut stages: Vec<Arc<dyn Stage>> = self.stages.iter().cloned().collect();
        stages.push(Arc::new(stage));
        Chain {
            stages: Arc::from(stages),
            redaction_sink: self.redaction_sink.clone(),
            body_limit: self.body_limit,
        }
    }

    /// Attaches the store receiving redacted form values.
    pub fn with_redaction_sink(mut self, sink: Option<Arc<dyn RedactionSink>>) -> Self {
        self.redaction_sink = sink;
        self
    }

    pub fn redaction_sink(&self) -> Option<&Arc<dyn RedactionSink>> {
        self.redaction_sink.as_ref()
    }

    /// Caps how many request body bytes are buffered for the chain.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Composes the chain around `endpoint`.
    pub fn then<H: Handler>(&self, endpoint: H) -> Then<H> {
        Then {
            chain: self.clone(),
            endpoint,
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.stages.len())
            .field("redaction", &self.redaction_sink.is_some())
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

/// A chain composed around its endpoint.
pub struct Then<H> {
    chain: Chain,
    endpoint: H,
}

impl<H: Handler> Handler for Then<H> {
    fn call<'a>(&'a self, cx: &'a mut RequestContext) -> BoxFuture<'a, ChainResult> {
        cx.set_redaction_sink(self.chain.redaction_sink.clone());
        Next {
            stages: &self.chain.stages,
            endpoint: &self.endpoint,
        }
        .run(cx)
    }
}
