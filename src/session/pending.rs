//! Outstanding requests awaiting a reply, keyed by correlation id

use std::collections::HashMap;

use thiserror::Error;

use crate::mcp::types::{CallId, ToolCallResult, ToolDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    ToolList(Vec<ToolDescriptor>),
    ToolResult(ToolCallResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("request id `{0}` is already outstanding")]
    AlreadyIssued(CallId),
    #[error("reply for `{0}` matches no outstanding request")]
    Unmatched(CallId),
    #[error("duplicate reply for `{0}`")]
    Duplicate(CallId),
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    slots: HashMap<CallId, Option<Reply>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, id: CallId) -> Result<(), CorrelationError> {
        if self.slots.contains_key(&id) {
            return Err(CorrelationError::AlreadyIssued(id));
        }
        self.slots.insert(id, None);
        Ok(())
    }

    /// Fills the slot of an outstanding request. The reply is rejected when no
    /// request with that id is outstanding or the slot is already filled.
    pub fn resolve(&mut self, id: CallId, reply: Reply) -> Result<(), CorrelationError> {
        match self.slots.get_mut(&id) {
            None => Err(CorrelationError::Unmatched(id)),
            Some(Some(_)) => Err(CorrelationError::Duplicate(id)),
            Some(slot) => {
                *slot = Some(reply);
                Ok(())
            }
        }
    }

    /// Removes a resolved request and hands back its reply.
    pub fn take(&mut self, id: &CallId) -> Option<Reply> {
        match self.slots.get(id) {
            Some(Some(_)) => self.slots.remove(id).flatten(),
            _ => None,
        }
    }

    pub fn is_outstanding(&self, id: &CallId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forgets every outstanding request, returning their ids.
    pub fn fail_all(&mut self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.slots.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }
}
