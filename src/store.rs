use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;
use tracing::debug;

use crate::accession::AccessionKind;
use crate::error::SeqstageError;
use crate::record::TableRecord;

/// Persistent keyed table per accession kind. Each kind is backed by one TSV
/// file under the store root, loaded fully into memory on first access and
/// rewritten atomically on every successful put. Records are append-only:
/// a same-content put is a no-op, a conflicting put is `DuplicateKey`.
#[derive(Debug)]
pub struct AccessionStore {
    root: Utf8PathBuf,
    studies: RwLock<Option<Table>>,
    samples: RwLock<Option<Table>>,
    runs: RwLock<Option<Table>>,
}

#[derive(Debug)]
struct Table {
    rows: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl Table {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl AccessionStore {
    pub fn new() -> Result<Self, SeqstageError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("seqstage").join("db"))
                    .ok()
            })
            .ok_or_else(|| {
                SeqstageError::Filesystem("unable to resolve store directory".to_string())
            })?;
        Ok(Self::new_with_root(root))
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            studies: RwLock::new(None),
            samples: RwLock::new(None),
            runs: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn table_path(&self, kind: AccessionKind) -> Utf8PathBuf {
        self.root.join(format!("{}.tsv", kind.table_name()))
    }

    pub fn exists<R: TableRecord>(&self, id: &str) -> Result<bool, SeqstageError> {
        self.with_table::<R, _>(|table| Ok(table.index.contains_key(id)))
    }

    pub fn get<R: TableRecord>(&self, id: &str) -> Result<R, SeqstageError> {
        self.with_table::<R, _>(|table| {
            let pos = table.index.get(id).ok_or_else(|| SeqstageError::NotFound {
                kind: R::KIND,
                id: id.to_string(),
            })?;
            R::from_row(&table.rows[*pos])
        })
    }

    pub fn all<R: TableRecord>(&self) -> Result<Vec<R>, SeqstageError> {
        self.with_table::<R, _>(|table| table.rows.iter().map(|row| R::from_row(row)).collect())
    }

    pub fn put<R: TableRecord>(&self, record: &R) -> Result<(), SeqstageError> {
        self.put_many(std::slice::from_ref(record))
    }

    /// Appends every record, then rewrites the table file once. The rewrite is
    /// O(total rows), so batching is preferred over repeated single puts.
    pub fn put_many<R: TableRecord>(&self, records: &[R]) -> Result<(), SeqstageError> {
        if records.is_empty() {
            return Ok(());
        }
        let cell = self.cell(R::KIND);
        let mut guard = cell.write().map_err(|_| poisoned(R::KIND))?;
        if guard.is_none() {
            *guard = Some(self.load::<R>()?);
        }
        let table = match guard.as_mut() {
            Some(table) => table,
            None => return Err(poisoned(R::KIND)),
        };

        // Validate the whole batch before mutating anything.
        let mut fresh: Vec<(String, Vec<String>)> = Vec::new();
        for record in records {
            let id = record.accession_id().to_string();
            let row = record.to_row();
            if let Some(pos) = table.index.get(&id) {
                if table.rows[*pos] == row {
                    debug!(id = %id, kind = %R::KIND, "store put is a no-op");
                    continue;
                }
                return Err(SeqstageError::DuplicateKey { kind: R::KIND, id });
            }
            if let Some((_, pending)) = fresh.iter().find(|(seen, _)| *seen == id) {
                if *pending == row {
                    continue;
                }
                return Err(SeqstageError::DuplicateKey { kind: R::KIND, id });
            }
            fresh.push((id, row));
        }
        if fresh.is_empty() {
            return Ok(());
        }

        for (id, row) in fresh {
            table.index.insert(id, table.rows.len());
            table.rows.push(row);
        }
        self.rewrite::<R>(table)
    }

    /// Drops the in-memory copy of one kind so the next access re-reads the
    /// backing file. Needed only when external mutation is suspected.
    pub fn reload(&self, kind: AccessionKind) -> Result<(), SeqstageError> {
        let mut guard = self.cell(kind).write().map_err(|_| poisoned(kind))?;
        *guard = None;
        Ok(())
    }

    fn cell(&self, kind: AccessionKind) -> &RwLock<Option<Table>> {
        match kind {
            AccessionKind::Study => &self.studies,
            AccessionKind::Sample => &self.samples,
            AccessionKind::Run => &self.runs,
        }
    }

    fn with_table<R: TableRecord, T>(
        &self,
        f: impl FnOnce(&Table) -> Result<T, SeqstageError>,
    ) -> Result<T, SeqstageError> {
        let cell = self.cell(R::KIND);
        {
            let guard = cell.read().map_err(|_| poisoned(R::KIND))?;
            if let Some(table) = guard.as_ref() {
                return f(table);
            }
        }
        let mut guard = cell.write().map_err(|_| poisoned(R::KIND))?;
        if guard.is_none() {
            *guard = Some(self.load::<R>()?);
        }
        let table = match guard.as_ref() {
            Some(table) => table,
            None => return Err(poisoned(R::KIND)),
        };
        f(table)
    }

    fn load<R: TableRecord>(&self) -> Result<Table, SeqstageError> {
        let path = self.table_path(R::KIND);
        if !path.as_std_path().is_file() {
            return Ok(Table::empty());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| SeqstageError::Filesystem(format!("read {path}: {err}")))?;
        let mut lines = content.lines();
        let header = lines.next().unwrap_or("");
        let columns: Vec<&str> = header.split('\t').collect();
        if columns != R::SCHEMA {
            return Err(SeqstageError::SchemaMismatch {
                kind: R::KIND,
                message: format!("header [{}] does not match declared schema", header),
            });
        }

        let mut table = Table::empty();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let row: Vec<String> = line.split('\t').map(unescape_cell).collect();
            let record = R::from_row(&row)?;
            let id = record.accession_id().to_string();
            if table.index.contains_key(&id) {
                return Err(SeqstageError::SchemaMismatch {
                    kind: R::KIND,
                    message: format!("duplicate id in table file: {id}"),
                });
            }
            table.index.insert(id, table.rows.len());
            table.rows.push(row);
        }
        debug!(kind = %R::KIND, rows = table.rows.len(), "loaded accession table");
        Ok(table)
    }

    fn rewrite<R: TableRecord>(&self, table: &Table) -> Result<(), SeqstageError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        let mut content = String::new();
        content.push_str(&R::SCHEMA.join("\t"));
        content.push('\n');
        for row in &table.rows {
            let cells: Vec<String> = row.iter().map(|cell| escape_cell(cell)).collect();
            content.push_str(&cells.join("\t"));
            content.push('\n');
        }

        let path = self.table_path(R::KIND);
        let temp = Builder::new()
            .prefix(R::KIND.table_name())
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content.as_bytes())
            .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn poisoned(kind: AccessionKind) -> SeqstageError {
    SeqstageError::Filesystem(format!("{kind} table lock poisoned"))
}

fn escape_cell(cell: &str) -> String {
    cell.replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn unescape_cell(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    let mut chars = cell.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::record::StudyRecord;

    fn study(id: &str, title: &str) -> StudyRecord {
        StudyRecord {
            accession_id: id.parse().unwrap(),
            title: title.to_string(),
            summary: String::new(),
            child_sample_ids: Vec::new(),
        }
    }

    fn temp_store(temp: &tempfile::TempDir) -> AccessionStore {
        let root = Utf8PathBuf::from_path_buf(temp.path().join("db")).unwrap();
        AccessionStore::new_with_root(root)
    }

    #[test]
    fn put_then_get() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp_store(&temp);
        let record = study("GSE102902", "snRNA-seq of mouse cortex");

        assert!(!store.exists::<StudyRecord>("GSE102902").unwrap());
        store.put(&record).unwrap();
        assert!(store.exists::<StudyRecord>("GSE102902").unwrap());
        assert_eq!(store.get::<StudyRecord>("GSE102902").unwrap(), record);
    }

    #[test]
    fn same_content_put_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp_store(&temp);
        let record = study("GSE102902", "title");
        store.put(&record).unwrap();
        store.put(&record).unwrap();
        assert_eq!(store.all::<StudyRecord>().unwrap().len(), 1);
    }

    #[test]
    fn conflicting_put_is_duplicate_key() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp_store(&temp);
        store.put(&study("GSE102902", "one")).unwrap();
        let err = store.put(&study("GSE102902", "two")).unwrap_err();
        assert_matches!(err, SeqstageError::DuplicateKey { .. });
    }

    #[test]
    fn missing_record_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp_store(&temp);
        let err = store.get::<StudyRecord>("GSE1").unwrap_err();
        assert_matches!(
            err,
            SeqstageError::NotFound {
                kind: AccessionKind::Study,
                ..
            }
        );
    }

    #[test]
    fn survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let record = study("GSE102902", "persisted");
        {
            let store = temp_store(&temp);
            store.put(&record).unwrap();
        }
        let store = temp_store(&temp);
        assert_eq!(store.get::<StudyRecord>("GSE102902").unwrap(), record);
    }

    #[test]
    fn cells_with_tabs_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let record = study("GSE102902", "tab\there\nand newline");
        {
            let store = temp_store(&temp);
            store.put(&record).unwrap();
        }
        let store = temp_store(&temp);
        assert_eq!(
            store.get::<StudyRecord>("GSE102902").unwrap().title,
            "tab\there\nand newline"
        );
    }
}
