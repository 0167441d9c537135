use tracing::{debug, instrument, warn};

use trail_core::ids::EventId;
use trail_core::{Category, Event, EventType, PipelineError};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::schema;

/// Durable FIFO of events for one category.
///
/// Every operation runs in a single transaction, so a failed call leaves the
/// table exactly as it was. Read failures surface as
/// [`PipelineError::DatabaseReadFailed`], write failures as
/// [`PipelineError::DatabaseWriteFailed`].
#[derive(Clone)]
pub struct EventQueue {
    db: Database,
    category: Category,
}

impl EventQueue {
    pub fn new(db: Database, category: Category) -> Self {
        Self { db, category }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn table(&self) -> &'static str {
        schema::events_table(self.category)
    }

    #[instrument(skip(self, events), fields(category = %self.category, count = events.len()))]
    pub fn append(&self, events: &[Event]) -> Result<(), PipelineError> {
        if events.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (id, type, sorted_key, data, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            self.table()
        );
        self.db
            .with_tx(|tx| {
                let mut stmt = tx.prepare(&sql)?;
                for event in events {
                    stmt.execute(rusqlite::params![
                        event.id().as_str(),
                        event.event_type().as_str(),
                        event.sorted_key(),
                        event.data(),
                        event.recorded_at(),
                    ])?;
                }
                Ok(())
            })
            .map_err(write_failed)?;
        debug!("events appended");
        Ok(())
    }

    /// Delete the given events by id. Returns the number of rows removed.
    #[instrument(skip(self, events), fields(category = %self.category, count = events.len()))]
    pub fn delete(&self, events: &[Event]) -> Result<usize, PipelineError> {
        if events.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.table());
        let removed = self
            .db
            .with_tx(|tx| {
                let mut stmt = tx.prepare(&sql)?;
                let mut removed = 0;
                for event in events {
                    removed += stmt.execute([event.id().as_str()])?;
                }
                Ok(removed)
            })
            .map_err(write_failed)?;
        if removed < events.len() {
            debug!(removed, "some events were already gone");
        }
        Ok(removed)
    }

    /// Moves events that can never be delivered out of the queue and into
    /// `quarantined_events`, keeping the reason with each one.
    #[instrument(skip(self, rejected), fields(category = %self.category, count = rejected.len()))]
    pub fn quarantine(&self, rejected: &[(Event, String)]) -> Result<usize, PipelineError> {
        if rejected.is_empty() {
            return Ok(0);
        }
        let remove = format!("DELETE FROM {} WHERE id = ?1", self.table());
        let moved = self
            .db
            .with_tx(|tx| {
                let mut insert = tx.prepare(
                    "INSERT INTO quarantined_events \
                     (category, id, type, sorted_key, data, recorded_at, reason) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                let mut delete = tx.prepare(&remove)?;
                let mut moved = 0;
                for (event, reason) in rejected {
                    if delete.execute([event.id().as_str()])? == 0 {
                        continue;
                    }
                    insert.execute(rusqlite::params![
                        self.category.as_str(),
                        event.id().as_str(),
                        event.event_type().as_str(),
                        event.sorted_key(),
                        event.data(),
                        event.recorded_at(),
                        reason,
                    ])?;
                    moved += 1;
                }
                Ok(moved)
            })
            .map_err(write_failed)?;
        if moved > 0 {
            warn!(moved, "undeliverable events quarantined");
        }
        Ok(moved)
    }

    /// Events of this category sitting in quarantine.
    pub fn quarantined(&self) -> Result<usize, PipelineError> {
        self.db
            .with_conn(|conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM quarantined_events WHERE category = ?1",
                    [self.category.as_str()],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .map_err(read_failed)
    }

    /// Oldest `limit` events in insertion order.
    #[instrument(skip(self), fields(category = %self.category))]
    pub fn fetch_oldest(&self, limit: usize) -> Result<Vec<Event>, PipelineError> {
        let table = self.table();
        let sql = format!(
            "SELECT id, type, sorted_key, data, recorded_at FROM {table} ORDER BY seq ASC LIMIT ?1"
        );
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([limit as i64])?;
                let mut events = Vec::new();
                while let Some(row) = rows.next()? {
                    events.push(row_to_event(row, table)?);
                }
                Ok(events)
            })
            .map_err(read_failed)
    }

    #[instrument(skip(self), fields(category = %self.category))]
    pub fn delete_all(&self) -> Result<usize, PipelineError> {
        let sql = format!("DELETE FROM {}", self.table());
        let removed = self
            .db
            .with_tx(|tx| Ok(tx.execute(&sql, [])?))
            .map_err(write_failed)?;
        if removed > 0 {
            warn!(removed, "queue purged");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, PipelineError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table());
        self.db
            .with_conn(|conn| {
                let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .map_err(read_failed)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>, table: &'static str) -> Result<Event, StoreError> {
    let id: String = row_helpers::get(row, 0, table, "id")?;
    let type_str: String = row_helpers::get(row, 1, table, "type")?;
    let event_type: EventType = row_helpers::parse_enum(&type_str, table, "type")?;
    Ok(Event::restore(
        EventId::from_raw(id),
        event_type,
        row_helpers::get(row, 2, table, "sorted_key")?,
        row_helpers::get(row, 3, table, "data")?,
        row_helpers::get(row, 4, table, "recorded_at")?,
    ))
}

fn read_failed(e: StoreError) -> PipelineError {
    PipelineError::DatabaseReadFailed(e.to_string())
}

fn write_failed(e: StoreError) -> PipelineError {
    PipelineError::DatabaseWriteFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(key: &str) -> Event {
        Event::new(EventType::Location, key, &json!({"k": key}), Utc::now())
    }

    fn queue(category: Category) -> EventQueue {
        EventQueue::new(Database::in_memory().unwrap(), category)
    }

    #[test]
    fn fetch_oldest_is_fifo() {
        let q = queue(Category::Online);
        let batch: Vec<Event> = (0..5).map(|i| event(&format!("e{i}"))).collect();
        q.append(&batch[..3]).unwrap();
        q.append(&batch[3..]).unwrap();

        let fetched = q.fetch_oldest(4).unwrap();
        let keys: Vec<&str> = fetched.iter().map(|e| e.sorted_key()).collect();
        assert_eq!(keys, vec!["e0", "e1", "e2", "e3"]);
        assert_eq!(fetched[0], batch[0]);
    }

    #[test]
    fn delete_removes_only_given_events() {
        let q = queue(Category::Online);
        let batch: Vec<Event> = (0..3).map(|i| event(&format!("e{i}"))).collect();
        q.append(&batch).unwrap();

        assert_eq!(q.delete(&batch[..2]).unwrap(), 2);
        let rest = q.fetch_oldest(10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id(), batch[2].id());

        // Already-deleted ids are not an error.
        assert_eq!(q.delete(&batch[..2]).unwrap(), 0);
    }

    #[test]
    fn categories_are_isolated() {
        let db = Database::in_memory().unwrap();
        let online = EventQueue::new(db.clone(), Category::Online);
        let custom = EventQueue::new(db, Category::Custom);

        online.append(&[event("a"), event("b")]).unwrap();
        custom.append(&[event("c")]).unwrap();

        assert_eq!(online.count().unwrap(), 2);
        assert_eq!(custom.count().unwrap(), 1);

        custom.delete_all().unwrap();
        assert_eq!(online.count().unwrap(), 2);
        assert_eq!(custom.count().unwrap(), 0);
    }

    #[test]
    fn quarantine_moves_rows_out_of_the_queue() {
        let db = Database::in_memory().unwrap();
        let online = EventQueue::new(db.clone(), Category::Online);
        let custom = EventQueue::new(db, Category::Custom);
        let batch = [event("bad"), event("good")];
        online.append(&batch).unwrap();

        let rejected = vec![(batch[0].clone(), "unreadable data".to_string())];
        assert_eq!(online.quarantine(&rejected).unwrap(), 1);
        // A second pass finds nothing left to move.
        assert_eq!(online.quarantine(&rejected).unwrap(), 0);

        let left = online.fetch_oldest(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sorted_key(), "good");
        assert_eq!(online.quarantined().unwrap(), 1);
        assert_eq!(custom.quarantined().unwrap(), 0);
    }

    #[test]
    fn fetch_from_empty_queue_returns_nothing() {
        let q = queue(Category::Custom);
        assert!(q.fetch_oldest(50).unwrap().is_empty());
    }

    #[test]
    fn failed_append_is_not_partially_visible() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON online_events
                 WHEN NEW.sorted_key = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned row'); END;",
            )?;
            Ok(())
        })
        .unwrap();
        let q = EventQueue::new(db, Category::Online);
        q.append(&[event("keep")]).unwrap();

        let err = q
            .append(&[event("x"), event("y"), event("poison")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::DatabaseWriteFailed(_)));

        let left = q.fetch_oldest(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sorted_key(), "keep");
    }

    #[test]
    fn storage_errors_map_to_read_and_write_failures() {
        let db = Database::in_memory().unwrap();
        let q = EventQueue::new(db.clone(), Category::Online);
        db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE online_events")?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            q.fetch_oldest(1),
            Err(PipelineError::DatabaseReadFailed(_))
        ));
        assert!(matches!(
            q.append(&[event("a")]),
            Err(PipelineError::DatabaseWriteFailed(_))
        ));
    }

    #[test]
    fn corrupt_type_column_is_a_read_failure() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO online_events (id, type, sorted_key, data, recorded_at)
                 VALUES ('x', 'teleport', 'k', '{}', 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let q = EventQueue::new(db, Category::Online);
        let err = q.fetch_oldest(1).unwrap_err();
        match err {
            PipelineError::DatabaseReadFailed(msg) => assert!(msg.contains("teleport")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
