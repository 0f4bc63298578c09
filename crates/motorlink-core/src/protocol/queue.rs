//! Pending read requests

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::codec;
use super::{Frame, RequestError};
use crate::map::{Descriptor, ParamRequest, Reading, Value};

pub(crate) type RequestResult = Result<Reading, RequestError>;

/// Callback form of a completion
pub(crate) type Callback = Box<dyn FnOnce(Result<Reading, RequestError>) + Send + 'static>;

/// Where a request's outcome goes
pub(crate) enum Completion {
    Reply(oneshot::Sender<RequestResult>),
    Callback(Callback),
    /// Liveness probes only care that the controller answered
    Discard,
}

impl Completion {
    pub fn complete(self, result: RequestResult) {
        match self {
            Completion::Reply(tx) => {
                // Caller may have stopped waiting
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => callback(result),
            Completion::Discard => {}
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Reply(_) => f.write_str("Reply"),
            Completion::Callback(_) => f.write_str("Callback"),
            Completion::Discard => f.write_str("Discard"),
        }
    }
}

/// One caller read: a flat list of descriptors fetched in order
#[derive(Debug)]
pub(crate) struct Request {
    shape: ParamRequest,
    items: Vec<Arc<Descriptor>>,
    /// Index of the item being fetched
    cursor: usize,
    /// Address within the current item
    address_index: usize,
    /// Bytes collected for the current item
    raw: Vec<u8>,
    values: Vec<Value>,
    completion: Completion,
}

impl Request {
    pub fn new(shape: ParamRequest, completion: Completion) -> Self {
        let items = shape.expand();
        Self {
            shape,
            items,
            cursor: 0,
            address_index: 0,
            raw: Vec::new(),
            values: Vec::new(),
            completion,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|d| d.addresses().is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.items.len()
    }

    /// The frame for the address currently being fetched
    pub fn current_frame(&self) -> Option<Frame> {
        let item = self.items.get(self.cursor)?;
        codec::encode_read(item, self.address_index)
    }

    /// Store one response byte; returns true once every item has been read
    pub fn accept(&mut self, byte: u8) -> bool {
        let Some(item) = self.items.get(self.cursor) else {
            return true;
        };
        self.raw.push(byte);
        self.address_index += 1;
        if self.address_index >= item.addresses().len() {
            item.remember(&self.raw);
            self.values.push(codec::decode(item, &self.raw));
            self.raw.clear();
            self.address_index = 0;
            self.cursor += 1;
        }
        self.is_complete()
    }

    /// Deliver the assembled reading
    pub fn finish(self) {
        let mut values = self.values.into_iter();
        let result = Reading::assemble(&self.shape, &mut values).ok_or(RequestError::InvalidResponse);
        self.completion.complete(result);
    }

    pub fn fail(self, err: RequestError) {
        self.completion.complete(Err(err));
    }

    /// Short description for logs
    pub fn label(&self) -> String {
        match self.items.as_slice() {
            [] => "<empty>".to_string(),
            [only] => only.key().to_string(),
            [first, ..] => format!("{} (+{} more)", first.key(), self.items.len() - 1),
        }
    }
}

/// FIFO of requests; the head is the only one that may be in flight
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    requests: VecDeque<Request>,
}

impl RequestQueue {
    pub fn push(&mut self, request: Request) {
        self.requests.push_back(request);
    }

    pub fn head(&self) -> Option<&Request> {
        self.requests.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Request> {
        self.requests.front_mut()
    }

    pub fn pop(&mut self) -> Option<Request> {
        self.requests.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Remove every request that is not in flight
    pub fn take_waiting(&mut self, head_in_flight: bool) -> Vec<Request> {
        let keep = usize::from(head_in_flight).min(self.requests.len());
        self.requests.drain(keep..).collect()
    }

    pub fn take_all(&mut self) -> Vec<Request> {
        self.requests.drain(..).collect()
    }
}
