use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{TicketId, TicketRecord, Urgency};

pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Canonical, insertion-ordered ticket collection with at most one record per id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TicketRecord>", into = "Vec<TicketRecord>")]
pub struct RecordCollection {
    records: Vec<TicketRecord>,
    index: BTreeMap<TicketId, usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Upserted {
    Inserted,
    Replaced,
}

impl RecordCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection by upserting every record in sequence, so a later
    /// record with an already-seen id replaces the earlier one in place.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = TicketRecord>) -> Self {
        let mut collection = Self::new();
        for record in records {
            collection.upsert(record);
        }
        collection
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[TicketRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TicketRecord> {
        self.records.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TicketId> {
        self.records.iter().map(|record| &record.id)
    }

    #[must_use]
    pub fn get(&self, id: &TicketId) -> Option<&TicketRecord> {
        self.index.get(id).and_then(|position| self.records.get(*position))
    }

    #[must_use]
    pub fn contains(&self, id: &TicketId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn position(&self, id: &TicketId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn get_mut(&mut self, id: &TicketId) -> Option<&mut TicketRecord> {
        let position = *self.index.get(id)?;
        self.records.get_mut(position)
    }

    /// Insert when the id is absent, otherwise replace in place keeping position.
    pub fn upsert(&mut self, record: TicketRecord) -> Upserted {
        if let Some(existing) = self.get_mut(&record.id) {
            *existing = record;
            return Upserted::Replaced;
        }

        self.index.insert(record.id.clone(), self.records.len());
        self.records.push(record);
        Upserted::Inserted
    }

    pub fn remove(&mut self, id: &TicketId) -> Option<TicketRecord> {
        let position = self.index.remove(id)?;
        let removed = self.records.remove(position);
        for shifted in self.index.values_mut() {
            if *shifted > position {
                *shifted -= 1;
            }
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    /// Filter by urgency, then paginate. Pages are 1-based.
    #[must_use]
    pub fn view(&self, query: &ViewQuery) -> TicketPage {
        let page_size = if query.page_size == 0 { DEFAULT_PAGE_SIZE } else { query.page_size };
        let page = query.page.max(1);

        let matching = self
            .records
            .iter()
            .filter(|record| query.urgency.is_none() || query.urgency == Some(record.urgency))
            .collect::<Vec<_>>();
        let total_matching = matching.len();
        let page_count = total_matching.div_ceil(page_size);

        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect();

        TicketPage { items, page, page_size, total_matching, page_count }
    }

    /// Explicit urgency ordering, most severe first, stable on insertion order.
    #[must_use]
    pub fn sorted_by_urgency(&self) -> Vec<&TicketRecord> {
        let mut sorted = self.records.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|record| std::cmp::Reverse(record.urgency.severity_rank()));
        sorted
    }
}

impl PartialEq for RecordCollection {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
    }
}

impl Eq for RecordCollection {}

impl From<Vec<TicketRecord>> for RecordCollection {
    fn from(records: Vec<TicketRecord>) -> Self {
        Self::from_records(records)
    }
}

impl From<RecordCollection> for Vec<TicketRecord> {
    fn from(collection: RecordCollection) -> Self {
        collection.records
    }
}

impl<'a> IntoIterator for &'a RecordCollection {
    type Item = &'a TicketRecord;
    type IntoIter = std::slice::Iter<'a, TicketRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ViewQuery {
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ViewQuery {
    fn default() -> Self {
        Self { urgency: None, page: default_page(), page_size: default_page_size() }
    }
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TicketPage {
    pub items: Vec<TicketRecord>,
    pub page: usize,
    pub page_size: usize,
    pub total_matching: usize,
    pub page_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Confidence, TriageError};

    fn fixture_id(input: &str) -> TicketId {
        match TicketId::parse(input) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture id {input}: {err}"),
        }
    }

    fn mk_ticket(id: &str, urgency: Urgency) -> TicketRecord {
        let mut record = TicketRecord::new(fixture_id(id), format!("Customer {id}"), "message");
        record.urgency = urgency;
        if urgency.is_classified() {
            record.confidence = Confidence::from_percent(50.0).unwrap_or_default();
        }
        record
    }

    fn ids_of<'a>(records: impl IntoIterator<Item = &'a TicketRecord>) -> Vec<&'a str> {
        records.into_iter().map(|record| record.id.as_str()).collect()
    }

    // Test IDs: TCOL-001
    #[test]
    fn upsert_replaces_in_place_without_duplicating() {
        let mut collection = RecordCollection::new();
        assert_eq!(collection.upsert(mk_ticket("1", Urgency::Unclassified)), Upserted::Inserted);
        assert_eq!(collection.upsert(mk_ticket("2", Urgency::Unclassified)), Upserted::Inserted);
        assert_eq!(collection.upsert(mk_ticket("1", Urgency::High)), Upserted::Replaced);

        assert_eq!(collection.len(), 2);
        assert_eq!(ids_of(&collection), vec!["1", "2"]);
        assert_eq!(
            collection.get(&fixture_id("1")).map(|record| record.urgency),
            Some(Urgency::High)
        );
    }

    // Test IDs: TCOL-002
    #[test]
    fn remove_keeps_index_consistent_for_later_records() {
        let mut collection = RecordCollection::from_records(
            ["1", "2", "3", "4"].into_iter().map(|id| mk_ticket(id, Urgency::Unclassified)),
        );

        let removed = collection.remove(&fixture_id("2"));
        assert_eq!(removed.map(|record| record.id), Some(fixture_id("2")));
        assert!(collection.remove(&fixture_id("2")).is_none());

        assert_eq!(collection.position(&fixture_id("3")), Some(1));
        assert_eq!(collection.position(&fixture_id("4")), Some(2));
        assert_eq!(collection.get(&fixture_id("4")).map(|record| record.id.as_str()), Some("4"));

        collection.upsert(mk_ticket("3", Urgency::Low));
        assert_eq!(ids_of(&collection), vec!["1", "3", "4"]);
    }

    // Test IDs: TCOL-003
    #[test]
    fn deserialization_collapses_duplicate_ids() -> Result<(), serde_json::Error> {
        let json = serde_json::json!([
            {"id": "1", "customer": "Acme", "message": "first", "urgency": "unclassified", "confidence": 0.0},
            {"id": "2", "customer": "Globex", "message": "second"},
            {"id": "1", "customer": "Acme", "message": "first again", "urgency": "high", "confidence": 91.0}
        ]);
        let collection: RecordCollection = serde_json::from_value(json)?;

        assert_eq!(ids_of(&collection), vec!["1", "2"]);
        assert_eq!(
            collection.get(&fixture_id("1")).map(|record| record.message.as_str()),
            Some("first again")
        );
        Ok(())
    }

    // Test IDs: TCOL-004
    #[test]
    fn view_filters_then_paginates_without_reordering() {
        let collection = RecordCollection::from_records((1..=25).map(|index| {
            let urgency = if index % 2 == 0 { Urgency::High } else { Urgency::Unclassified };
            mk_ticket(&index.to_string(), urgency)
        }));

        let first = collection.view(&ViewQuery::default());
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.total_matching, 25);
        assert_eq!(first.page_count, 3);

        let last = collection.view(&ViewQuery { page: 3, ..ViewQuery::default() });
        assert_eq!(last.items.len(), 5);

        let high = collection.view(&ViewQuery {
            urgency: Some(Urgency::High),
            page: 2,
            page_size: 5,
        });
        assert_eq!(high.total_matching, 12);
        assert_eq!(ids_of(&high.items), vec!["12", "14", "16", "18", "20"]);

        let beyond = collection.view(&ViewQuery { page: 9, ..ViewQuery::default() });
        assert!(beyond.items.is_empty());
    }

    // Test IDs: TCOL-005
    #[test]
    fn sorted_by_urgency_is_explicit_and_stable() {
        let collection = RecordCollection::from_records([
            mk_ticket("a", Urgency::Low),
            mk_ticket("b", Urgency::Extreme),
            mk_ticket("c", Urgency::Unclassified),
            mk_ticket("d", Urgency::Low),
            mk_ticket("e", Urgency::Unknown),
        ]);

        assert_eq!(ids_of(collection.sorted_by_urgency()), vec!["b", "a", "d", "e", "c"]);
        assert_eq!(ids_of(&collection), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn blank_fixture_ids_are_rejected() {
        assert!(matches!(TicketId::parse(""), Err(TriageError::Validation(_))));
    }
}
