//! Column readers that attribute failures to the table and column they came from.

use std::str::FromStr;

use rusqlite::types::FromSql;
use rusqlite::Row;

use crate::error::StoreError;

pub fn get<T: FromSql>(
    row: &Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx)
        .map_err(|e| StoreError::corrupt(table, column, e.to_string()))
}

/// Reads a text column through `FromStr`, e.g. the stored event type.
pub fn parse_enum<T: FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    T::from_str(raw).map_err(|_| StoreError::corrupt(table, column, format!("`{raw}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::EventType;

    #[test]
    fn known_type_parses() {
        let parsed: EventType = parse_enum("location", "online_events", "type").unwrap();
        assert_eq!(parsed, EventType::Location);
    }

    #[test]
    fn unknown_type_names_the_column() {
        let err = parse_enum::<EventType>("teleport", "custom_events", "type").unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow { table: "custom_events", column: "type", .. }
        ));
        assert!(err.to_string().contains("teleport"));
    }
}
