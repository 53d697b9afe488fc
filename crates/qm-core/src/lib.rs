//! Core domain model for the quote metadata pipeline.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "qm-core";

/// Number of quote slots carried by every record, no more, no fewer.
pub const QUOTE_SLOTS: usize = 8;

/// Maximum trimmed length (in characters) of a quote kept by the pipeline.
pub const MAX_QUOTE_CHARS: usize = 180;

/// Cell text marking an absent quote slot in tabular form.
pub const SLOT_SENTINEL: &str = "NA";

/// Raw scraped row handed from a source adapter into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedRow {
    pub serial: u32,
    pub quote: String,
    pub link: String,
    pub author: String,
}

/// One slot of a quote record: a kept quote or an explicitly absent marker.
///
/// The tabular form collapses both empty cells and the literal sentinel
/// text into `Absent`, so a real quote whose text is exactly the sentinel
/// does not survive a round trip through CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QuoteSlot {
    Present(String),
    Absent,
}

impl QuoteSlot {
    pub fn from_cell(cell: &str) -> Self {
        if cell == SLOT_SENTINEL || cell.trim().is_empty() {
            Self::Absent
        } else {
            Self::Present(cell.to_string())
        }
    }

    pub fn as_cell(&self) -> &str {
        match self {
            Self::Present(text) => text,
            Self::Absent => SLOT_SENTINEL,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl From<String> for QuoteSlot {
    fn from(cell: String) -> Self {
        Self::from_cell(&cell)
    }
}

impl From<QuoteSlot> for String {
    fn from(slot: QuoteSlot) -> Self {
        slot.as_cell().to_string()
    }
}

/// One row per author: a fixed array of quote slots in first-encounter order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub author: String,
    pub quotes: [QuoteSlot; QUOTE_SLOTS],
}

impl QuoteRecord {
    /// Build a record from surviving quotes: the first [`QUOTE_SLOTS`] are
    /// kept in order, short groups are padded with `Absent`.
    pub fn from_survivors(author: impl Into<String>, survivors: Vec<String>) -> Self {
        let mut quotes: [QuoteSlot; QUOTE_SLOTS] = std::array::from_fn(|_| QuoteSlot::Absent);
        for (slot, quote) in quotes.iter_mut().zip(survivors) {
            *slot = QuoteSlot::Present(quote);
        }
        Self {
            author: author.into(),
            quotes,
        }
    }

    /// A record is complete when the author cell and all slots carry text.
    /// The author cell is subject to the same sentinel rule as the slots.
    pub fn is_complete(&self) -> bool {
        let author_missing = self.author.trim().is_empty() || self.author == SLOT_SENTINEL;
        !author_missing && self.quotes.iter().all(QuoteSlot::is_present)
    }

    /// Slot cells in slot order, sentinel text for absent slots.
    pub fn quote_cells(&self) -> impl Iterator<Item = &str> {
        self.quotes.iter().map(QuoteSlot::as_cell)
    }
}

/// A quote record tagged with its run-scoped custom identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedRecord {
    pub custom_id: String,
    pub record: QuoteRecord,
}

/// Metadata triple returned by the generation job for one identifier.
///
/// Missing keys deserialize to empty strings; unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedMetadata {
    pub storytitle: String,
    pub metadescription: String,
    pub metakeywords: String,
}

/// Final enriched row: identified record plus its generated metadata.
///
/// Records with no matching generation result carry the default (empty)
/// metadata triple rather than being dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub custom_id: String,
    pub record: QuoteRecord,
    pub metadata: GeneratedMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_and_blank_cells_are_absent() {
        assert_eq!(QuoteSlot::from_cell("NA"), QuoteSlot::Absent);
        assert_eq!(QuoteSlot::from_cell(""), QuoteSlot::Absent);
        assert_eq!(QuoteSlot::from_cell("   "), QuoteSlot::Absent);
        assert_eq!(
            QuoteSlot::from_cell("N.A."),
            QuoteSlot::Present("N.A.".to_string())
        );
    }

    #[test]
    fn absent_slot_renders_as_sentinel() {
        assert_eq!(QuoteSlot::Absent.as_cell(), "NA");
        assert_eq!(QuoteSlot::Present("hello".into()).as_cell(), "hello");
    }

    #[test]
    fn short_survivor_lists_are_padded_to_fixed_width() {
        let record = QuoteRecord::from_survivors("Bob", vec!["one".into(), "two".into()]);
        assert_eq!(record.quotes.len(), QUOTE_SLOTS);
        assert_eq!(record.quotes[0], QuoteSlot::Present("one".into()));
        assert_eq!(record.quotes[1], QuoteSlot::Present("two".into()));
        assert!(record.quotes[2..].iter().all(QuoteSlot::is_absent));
    }

    #[test]
    fn long_survivor_lists_are_truncated_to_fixed_width() {
        let survivors = (0..12).map(|i| format!("quote {i}")).collect();
        let record = QuoteRecord::from_survivors("Bob", survivors);
        assert_eq!(record.quotes.len(), QUOTE_SLOTS);
        assert!(record.quotes.iter().all(QuoteSlot::is_present));
        assert_eq!(record.quotes[7], QuoteSlot::Present("quote 7".into()));
    }

    #[test]
    fn completeness_requires_author_and_every_slot() {
        let full = QuoteRecord::from_survivors("Bob", (0..8).map(|i| format!("q{i}")).collect());
        assert!(full.is_complete());

        let padded = QuoteRecord::from_survivors("Bob", vec!["q".into()]);
        assert!(!padded.is_complete());

        let anonymous = QuoteRecord::from_survivors("  ", (0..8).map(|i| format!("q{i}")).collect());
        assert!(!anonymous.is_complete());

        let sentinel_author =
            QuoteRecord::from_survivors("NA", (0..8).map(|i| format!("q{i}")).collect());
        assert!(!sentinel_author.is_complete());
    }
}
