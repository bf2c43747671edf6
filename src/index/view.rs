//! Query-expression (view) index: wraps a compiled sub-query. Range and
//! equality bounds are pushed into the inner query as parameters; the
//! inner query's cost is cached per mask set for a bounded age.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{OpalError, Result};
use crate::index::cursor::{Cursor, MaterializedCursor};
use crate::index::{Index, IndexType, RowComparator};
use crate::row::{Row, SearchRow};
use crate::schema::column::IndexColumn;
use crate::session::Session;

/// How long a cached per-mask cost stays valid.
pub const VIEW_COST_CACHE_MAX_AGE: Duration = Duration::from_millis(10_000);

/// The compiled sub-query behind a view. Bounds arrive as sparse search
/// rows; the query treats their constrained slots as global parameters.
pub trait ViewQuery {
    fn execute(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Result<Vec<Row>>;

    /// Cost of one execution under the given masks.
    fn estimated_cost(&self, session: &mut Session, masks: Option<&[u8]>) -> f64;
}

pub struct ViewIndex {
    index_id: u32,
    name: String,
    query: Box<dyn ViewQuery>,
    expected_rows: i64,
    comparator: RowComparator,
    cost_cache: Mutex<HashMap<Vec<u8>, (Instant, f64)>>,
}

impl ViewIndex {
    pub fn new(index_id: u32, name: &str, query: Box<dyn ViewQuery>, expected_rows: i64) -> Self {
        ViewIndex {
            index_id,
            name: name.to_string(),
            query,
            expected_rows,
            comparator: RowComparator::default(),
            cost_cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Index for ViewIndex {
    fn index_id(&self) -> u32 {
        self.index_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index_type(&self) -> IndexType {
        IndexType::View
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    fn add(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("add on view index"))
    }

    fn remove(&mut self, _session: &mut Session, _row: &Row) -> Result<()> {
        Err(OpalError::Unsupported("remove on view index"))
    }

    fn find(
        &self,
        session: &mut Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
        reverse: bool,
    ) -> Result<Box<dyn Cursor>> {
        let rows = self.query.execute(session, first, last)?;
        Ok(Box::new(if reverse {
            MaterializedCursor::reversed(rows)
        } else {
            MaterializedCursor::new(rows)
        }))
    }

    fn get_cost(
        &self,
        session: &mut Session,
        masks: Option<&[u8]>,
        _sort_order: Option<&[IndexColumn]>,
        _projected_columns: Option<&[usize]>,
    ) -> f64 {
        let cache_key: Vec<u8> = masks.map(|m| m.to_vec()).unwrap_or_default();
        {
            let cache = self.cost_cache.lock();
            if let Some((at, cost)) = cache.get(&cache_key) {
                if at.elapsed() < VIEW_COST_CACHE_MAX_AGE {
                    return *cost;
                }
            }
        }
        let cost = self.query.estimated_cost(session, masks);
        self.cost_cache
            .lock()
            .insert(cache_key, (Instant::now(), cost));
        cost
    }

    fn row_count(&self, _session: &mut Session) -> i64 {
        self.expected_rows
    }

    fn row_count_approximation(&self) -> i64 {
        self.expected_rows
    }

    fn truncate(&mut self, _session: &mut Session) -> Result<()> {
        Err(OpalError::Unsupported("truncate on view index"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Options, Pager};
    use crate::types::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct CountingQuery {
        cost_calls: Arc<AtomicUsize>,
    }

    impl ViewQuery for CountingQuery {
        fn execute(
            &self,
            _session: &mut Session,
            first: Option<&SearchRow>,
            _last: Option<&SearchRow>,
        ) -> Result<Vec<Row>> {
            // The pushed-down bound becomes a parameter of the inner query.
            let lo = first
                .and_then(|f| f.value(0))
                .and_then(|v| v.as_i64())
                .unwrap_or(1);
            Ok((lo..=3)
                .map(|i| Row::new(i, vec![Value::BigInt(i)]))
                .collect())
        }

        fn estimated_cost(&self, _session: &mut Session, _masks: Option<&[u8]>) -> f64 {
            self.cost_calls.fetch_add(1, Ordering::SeqCst);
            30.0
        }
    }

    #[test]
    fn test_bound_pushdown_and_cost_cache() {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), Options::default()).unwrap();
        let mut session = Session::new(pager);

        let calls = Arc::new(AtomicUsize::new(0));
        let idx = ViewIndex::new(
            1,
            "v",
            Box::new(CountingQuery {
                cost_calls: calls.clone(),
            }),
            3,
        );

        let mut first = SearchRow::with_columns(1);
        first.set_value(0, Value::BigInt(2));
        let mut cursor = idx.find(&mut session, Some(&first), None, false).unwrap();
        let mut seen = Vec::new();
        while cursor.next(&mut session).unwrap() {
            seen.push(cursor.get().unwrap().value(0).as_i64().unwrap());
        }
        assert_eq!(seen, vec![2, 3]);

        // Same masks within the cache window: the inner query is asked
        // once.
        let masks = [crate::index::condition::START];
        assert_eq!(idx.get_cost(&mut session, Some(&masks), None, None), 30.0);
        assert_eq!(idx.get_cost(&mut session, Some(&masks), None, None), 30.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Different masks miss the cache.
        let other = [crate::index::condition::EQUALITY];
        idx.get_cost(&mut session, Some(&other), None, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
