//! Lazy object enumeration.

use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;

use super::SessionShared;
use crate::backend::ProtocolSession;
use crate::device::{ObjectHandle, StorageId, TransferObject};
use crate::session::SessionError;

enum ListingState {
    NotStarted,
    Buffered(VecDeque<TransferObject>),
    Done,
}

/// Objects under one parent, fetched on the first `next()`.
///
/// Each step re-checks that the session is still open. A listing that
/// outlives its session yields one `NotOpen` error and then ends.
pub struct ObjectListing<S: ProtocolSession> {
    shared: Arc<SessionShared<S>>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    name_filter: Option<String>,
    state: ListingState,
}

impl<S: ProtocolSession> ObjectListing<S> {
    pub(super) fn new(
        shared: Arc<SessionShared<S>>,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name_filter: Option<&str>,
    ) -> Self {
        Self {
            shared,
            storage,
            parent,
            name_filter: name_filter.map(str::to_string),
            state: ListingState::NotStarted,
        }
    }

    /// Next matching object, in device order.
    pub async fn next(&mut self) -> Option<Result<TransferObject, SessionError>> {
        match self.state {
            ListingState::Done => return None,
            ListingState::NotStarted => {
                if let Err(e) = self.fetch().await {
                    self.state = ListingState::Done;
                    return Some(Err(e));
                }
            }
            ListingState::Buffered(_) => {
                if !self.shared.is_open().await {
                    debug!("Listing on {} interrupted: session closed", self.shared.device_id);
                    self.state = ListingState::Done;
                    return Some(Err(self.shared.not_open()));
                }
            }
        }

        let ListingState::Buffered(buffer) = &mut self.state else {
            return None;
        };
        match buffer.pop_front() {
            Some(object) => Some(Ok(object)),
            None => {
                self.state = ListingState::Done;
                None
            }
        }
    }

    /// Drains the listing. Stops at the first error.
    pub async fn collect(mut self) -> Result<Vec<TransferObject>, SessionError> {
        let mut objects = Vec::new();
        while let Some(object) = self.next().await {
            objects.push(object?);
        }
        Ok(objects)
    }

    async fn fetch(&mut self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut guard = shared.acquire("list_objects").await?;
        let Some(session) = guard.as_mut() else {
            return Err(shared.not_open());
        };
        let objects = match shared.bounded(session.list_objects(self.storage, self.parent)).await {
            Ok(objects) => objects,
            Err(e) => {
                shared.check_channel(&mut guard, &e);
                return Err(shared.map_error(e, self.parent));
            }
        };
        drop(guard);

        let total = objects.len();
        let buffer: VecDeque<TransferObject> = match &self.name_filter {
            Some(prefix) => objects
                .into_iter()
                .filter(|o| starts_with_ignore_case(&o.name, prefix))
                .collect(),
            None => objects.into_iter().collect(),
        };
        debug!(
            "list_objects: {} of {} objects match on {} (storage={}, parent={:?})",
            buffer.len(),
            total,
            shared.device_id,
            self.storage.0,
            self.parent.map(|h| h.0)
        );
        self.state = ListingState::Buffered(buffer);
        Ok(())
    }
}

/// Case-insensitive prefix match that also folds non-ASCII letters.
pub(crate) fn starts_with_ignore_case(name: &str, prefix: &str) -> bool {
    let mut name_chars = name.chars().flat_map(char::to_lowercase);
    prefix
        .chars()
        .flat_map(char::to_lowercase)
        .all(|p| name_chars.next() == Some(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_ignore_case() {
        assert!(starts_with_ignore_case("Test.txt", "test"));
        assert!(starts_with_ignore_case("test.txt", "TEST.TXT"));
        assert!(starts_with_ignore_case("Ärger.txt", "ä"));
        assert!(starts_with_ignore_case("anything", ""));
        assert!(!starts_with_ignore_case("te", "test"));
        assert!(!starts_with_ignore_case("photo.jpg", "test"));
    }
}
