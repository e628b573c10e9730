use serde::{Deserialize, Serialize};

use crate::{RecordCollection, SelectionSet, TicketId, TicketRecord, Urgency};

/// Counts by urgency. Every category is always present; `total` counts only
/// the four classified labels, so `Unknown` and `Unclassified` never add to it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UrgencySummary {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub extreme: usize,
    pub total: usize,
}

impl UrgencySummary {
    #[must_use]
    pub fn count(&self, urgency: Urgency) -> usize {
        match urgency {
            Urgency::Low => self.low,
            Urgency::Medium => self.medium,
            Urgency::High => self.high,
            Urgency::Extreme => self.extreme,
            Urgency::Unclassified | Urgency::Unknown => 0,
        }
    }

    fn record(&mut self, urgency: Urgency) {
        let slot = match urgency {
            Urgency::Low => &mut self.low,
            Urgency::Medium => &mut self.medium,
            Urgency::High => &mut self.high,
            Urgency::Extreme => &mut self.extreme,
            Urgency::Unclassified | Urgency::Unknown => return,
        };
        *slot += 1;
        self.total += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SummaryScope<'a> {
    /// Every record carrying a classified urgency.
    Classified,
    /// Classified records that are also in the selection.
    Selection(&'a SelectionSet),
}

#[must_use]
pub fn summarize(collection: &RecordCollection, scope: SummaryScope<'_>) -> UrgencySummary {
    let in_scope = |record: &&TicketRecord| match scope {
        SummaryScope::Classified => true,
        SummaryScope::Selection(selection) => selection.contains(&record.id),
    };

    collection.iter().filter(in_scope).fold(UrgencySummary::default(), |mut summary, record| {
        summary.record(record.urgency);
        summary
    })
}

/// Return `collection` with exactly `ids` set back to unclassified. Unknown ids
/// are ignored; applying it twice is the same as applying it once.
#[must_use]
pub fn reset_classification<'a>(
    collection: &RecordCollection,
    ids: impl IntoIterator<Item = &'a TicketId>,
) -> RecordCollection {
    let mut reset = collection.clone();
    for id in ids {
        if let Some(record) = reset.get_mut(id) {
            record.clear_classification();
        }
    }
    reset
}
