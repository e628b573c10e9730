use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{RecordCollection, TicketId, TicketRecord, TriageError};

/// Ids marked for batch action. Independent of any filtered or paginated view,
/// and always a subset of the ids in the owning collection: every entry point
/// that adds ids checks them against the collection, and removals must be
/// pruned explicitly through [`SelectionSet::evict`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SelectionSet {
    ids: BTreeSet<TicketId>,
}

impl SelectionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip membership of one id and report whether it is now selected.
    ///
    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] when the id is not in `collection`.
    pub fn toggle(
        &mut self,
        id: &TicketId,
        collection: &RecordCollection,
    ) -> Result<bool, TriageError> {
        if self.ids.remove(id) {
            return Ok(false);
        }
        if !collection.contains(id) {
            return Err(TriageError::UnknownTicket(id.clone()));
        }
        self.ids.insert(id.clone());
        Ok(true)
    }

    /// Replace the whole selection. Either every id is accepted or the
    /// selection is left untouched.
    ///
    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] for the first id missing from `collection`.
    pub fn set_all<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a TicketId>,
        collection: &RecordCollection,
    ) -> Result<(), TriageError> {
        let mut next = BTreeSet::new();
        for id in ids {
            if !collection.contains(id) {
                return Err(TriageError::UnknownTicket(id.clone()));
            }
            next.insert(id.clone());
        }
        self.ids = next;
        Ok(())
    }

    /// Select every record of the full collection, regardless of what a view shows.
    pub fn select_all(&mut self, collection: &RecordCollection) {
        self.ids = collection.ids().cloned().collect();
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    #[must_use]
    pub fn contains(&self, id: &TicketId) -> bool {
        self.ids.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TicketId> {
        self.ids.iter()
    }

    pub fn evict(&mut self, id: &TicketId) -> bool {
        self.ids.remove(id)
    }

    /// Selected records in collection order. This is the one ordering used both
    /// to build a classification request and to apply its response.
    #[must_use]
    pub fn ordered_records<'a>(&self, collection: &'a RecordCollection) -> Vec<&'a TicketRecord> {
        collection.iter().filter(|record| self.ids.contains(&record.id)).collect()
    }
}
