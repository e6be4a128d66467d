//! Outstanding tool confirmations.
//!
//! Confirmations are not exchanges: they have no timer and wait for a human
//! decision for as long as it takes. An entry is keyed by request id and
//! tool name and leaves the set when it is answered.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use agent_link_core::ConfirmationRequest;

/// Decision state of a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
}

/// A confirmation as tracked by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfirmation {
    pub request: ConfirmationRequest,
    pub status: ConfirmationStatus,
    pub received_at: SystemTime,
}

#[derive(Clone, Default)]
pub struct ConfirmationSet {
    entries: Arc<Mutex<Vec<ToolConfirmation>>>,
}

impl ConfirmationSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ToolConfirmation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new request. A repeat of the same request replaces the old entry.
    pub fn insert(&self, request: ConfirmationRequest) {
        let mut entries = self.lock();
        entries.retain(|e| {
            !(e.request.request_id == request.request_id && e.request.name == request.name)
        });
        entries.push(ToolConfirmation {
            request,
            status: ConfirmationStatus::Pending,
            received_at: SystemTime::now(),
        });
    }

    /// Remove an entry, returning it with its final status.
    pub fn answer(&self, request_id: &str, name: &str, approved: bool) -> Option<ToolConfirmation> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|e| e.request.request_id == request_id && e.request.name == name)?;
        let mut entry = entries.remove(index);
        entry.status = if approved {
            ConfirmationStatus::Approved
        } else {
            ConfirmationStatus::Rejected
        };
        Some(entry)
    }

    /// Copy of an outstanding entry.
    #[must_use]
    pub fn get(&self, request_id: &str, name: &str) -> Option<ToolConfirmation> {
        self.lock()
            .iter()
            .find(|e| e.request.request_id == request_id && e.request.name == name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, request_id: &str, name: &str) -> bool {
        self.lock()
            .iter()
            .any(|e| e.request.request_id == request_id && e.request.name == name)
    }

    /// Outstanding confirmations in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ToolConfirmation> {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use agent_link_core::Arguments;

    use super::*;

    fn request(id: &str, name: &str) -> ConfirmationRequest {
        ConfirmationRequest {
            request_id: id.to_string(),
            name: name.to_string(),
            arguments: Arguments::new(),
            description: None,
        }
    }

    #[test]
    fn test_answer_removes_and_marks() {
        let set = ConfirmationSet::new();
        set.insert(request("tool-confirm-001", "execute_command"));
        set.insert(request("tool-confirm-002", "read_file"));

        let answered = set.answer("tool-confirm-001", "execute_command", false).unwrap();
        assert_eq!(answered.status, ConfirmationStatus::Rejected);
        assert!(!set.contains("tool-confirm-001", "execute_command"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.snapshot()[0].status, ConfirmationStatus::Pending);
    }

    #[test]
    fn test_answer_requires_matching_name() {
        let set = ConfirmationSet::new();
        set.insert(request("r1", "read_file"));
        assert!(set.answer("r1", "write_file", true).is_none());
        assert!(set.answer("r1", "read_file", true).is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn test_repeat_request_is_not_duplicated() {
        let set = ConfirmationSet::new();
        set.insert(request("r1", "read_file"));
        set.insert(request("r1", "read_file"));
        assert_eq!(set.len(), 1);
    }
}
