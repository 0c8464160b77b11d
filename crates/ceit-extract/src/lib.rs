//! Pure extraction over collected text: catalog matching, compound decomposition and
//! price parsing. Nothing here performs I/O.

pub mod decompose;
pub mod matcher;
pub mod price;

use ceit_core::PriceRecord;

pub use decompose::{fold_case, Decomposer, Decomposition};
pub use matcher::{
    normalize_name, CanonicalMatch, CatalogMatcher, MatchMethod, MatchReport, MatcherConfig,
    NameMatch,
};
pub use price::{
    extract_prices, flag_outliers, partition_event_prices, OutlierPolicy, PriceConfig,
};

/// Attaches canonical names to price items that resolve against the catalog.
pub fn attach_canonical_names(records: &mut [PriceRecord], matcher: &CatalogMatcher) {
    for record in records.iter_mut() {
        record.canonical_name = matcher
            .match_any_kind(&record.item_name)
            .canonical
            .map(|c| c.canonical_name);
    }
}
