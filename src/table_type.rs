//! Identifiers for specific tables
//!
//! In the general case the engine does not care what a table's bytes
//! represent; however lookups need to be identifiable so that we can try
//! alternate packing strategies (subtable splitting, extension promotion).

/// GSUB and GPOS lookup type constants the engine cares about.
pub(crate) mod lookup_type {
    pub const GPOS_PAIR_POS: u16 = 2;
    pub const GPOS_MARK_TO_BASE: u16 = 4;
    pub const GPOS_EXTENSION: u16 = 9;
    pub const GSUB_LIGATURE: u16 = 4;
    pub const GSUB_EXTENSION: u16 = 7;
}

/// A marker for the original source of a compiled table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TableType {
    /// A table with no special behaviour
    #[default]
    Unknown,
    /// A label used for diagnostics only
    Named(&'static str),
    GsubLookup(u16),
    GposLookup(u16),
}

impl TableType {
    /// `true` if this is a lookup that can be wrapped in extension subtables.
    pub(crate) fn is_promotable(self) -> bool {
        match self {
            TableType::GsubLookup(type_) => type_ != lookup_type::GSUB_EXTENSION,
            TableType::GposLookup(type_) => type_ != lookup_type::GPOS_EXTENSION,
            _ => false,
        }
    }

    pub(crate) fn is_splittable(self) -> bool {
        matches!(
            self,
            TableType::GposLookup(lookup_type::GPOS_PAIR_POS)
                | TableType::GposLookup(lookup_type::GPOS_MARK_TO_BASE)
                | TableType::GsubLookup(lookup_type::GSUB_LIGATURE)
        )
    }

    /// The raw lookup type, if this is a lookup.
    pub(crate) fn to_lookup_type(self) -> Option<u16> {
        match self {
            TableType::GsubLookup(type_) | TableType::GposLookup(type_) => Some(type_),
            _ => None,
        }
    }

    /// The type of this lookup after promotion to extension.
    pub(crate) fn promote(self) -> TableType {
        match self {
            TableType::GsubLookup(_) => TableType::GsubLookup(lookup_type::GSUB_EXTENSION),
            TableType::GposLookup(_) => TableType::GposLookup(lookup_type::GPOS_EXTENSION),
            other => other,
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TableType::Unknown => write!(f, "Unknown"),
            TableType::Named(name) => write!(f, "{name}"),
            TableType::GsubLookup(type_) => write!(f, "GsubLookup({type_})"),
            TableType::GposLookup(type_) => write!(f, "GposLookup({type_})"),
        }
    }
}
