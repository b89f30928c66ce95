//! Typed tables with secondary indexes over the KV environment.
//!
//! A [`Table`] spreads one logical collection across several redb
//! sub-databases: rows keyed by a monotonic row-id, one sub-database per
//! real index mapping index-key to row-id, and a meta sub-database holding
//! the last-index watermark and the row-id counter. All tables of a store
//! share one environment, so a single transaction spans any set of them and
//! commits atomically.
//!
//! Index keys concatenate the declared field values, each terminated by the
//! separator byte, which makes a lookup with fewer parts than fields a
//! prefix scan along field boundaries. A virtual index materializes nothing
//! of its own: it resolves to a real index and matches raw key prefixes,
//! ignoring the trailing separator.

use std::ops::Bound;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{self, BLANK, SEP};
use crate::error::{map_err, StateError, StateResult};
use crate::kv::{Env, Txn, TxnRef};

const LAST_INDEX_KEY: &str = "last_index";
const ROW_COUNTER_KEY: &str = "row_counter";

/// Extracts one indexed field from a row.
pub type FieldFn<R> = fn(&R) -> &str;

fn rows_def(name: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(name)
}

fn index_def(name: &str) -> TableDefinition<'_, &'static [u8], u64> {
    TableDefinition::new(name)
}

fn meta_def(name: &str) -> TableDefinition<'_, &'static str, u64> {
    TableDefinition::new(name)
}

pub(crate) fn meta_db_name(table: &str) -> String {
    format!("{table}.meta")
}

/// Open the right flavor of table handle for the transaction kind and run
/// `$body` against it. Both arms monomorphize the same generic helpers.
macro_rules! with_table {
    ($txn:expr, $def:expr, |$tbl:ident| $body:expr) => {
        match $txn.inner() {
            TxnRef::Read(t) => {
                let $tbl = t.open_table($def).map_err(map_err!(Table))?;
                $body
            }
            TxnRef::Write(t) => {
                let $tbl = t.open_table($def).map_err(map_err!(Table))?;
                $body
            }
        }
    };
}

/// One index declaration on a table.
pub struct IndexSchema<R> {
    name: &'static str,
    unique: bool,
    allow_blank: bool,
    virtual_of: Option<&'static str>,
    fields: Vec<FieldFn<R>>,
    db_name: String,
}

impl<R> IndexSchema<R> {
    /// A unique index: the encoded key maps to exactly one row.
    pub fn unique(name: &'static str, fields: Vec<FieldFn<R>>) -> Self {
        Self {
            name,
            unique: true,
            allow_blank: false,
            virtual_of: None,
            fields,
            db_name: String::new(),
        }
    }

    /// A non-unique index: entries are disambiguated by appending the
    /// row-id to the encoded key.
    pub fn non_unique(name: &'static str, fields: Vec<FieldFn<R>>) -> Self {
        Self {
            unique: false,
            ..Self::unique(name, fields)
        }
    }

    /// Admit rows whose indexed field is empty; a blank field encodes as
    /// the sentinel byte.
    pub fn allow_blank(mut self) -> Self {
        self.allow_blank = true;
        self
    }

    /// A virtual index: no storage of its own, resolves onto `real` and
    /// matches raw key prefixes instead of whole fields.
    pub fn virtual_prefix(name: &'static str, real: &'static str) -> Self {
        Self {
            name,
            unique: false,
            allow_blank: false,
            virtual_of: Some(real),
            fields: Vec::new(),
            db_name: String::new(),
        }
    }
}

/// How a lookup traverses an index sub-database.
enum Lookup {
    /// Exact key of a unique index: at most one row.
    Point(Vec<u8>),
    /// All entries whose key starts with these bytes, in ascending order.
    Prefix(Vec<u8>),
}

/// A typed collection with a primary index ("id"), optional secondary
/// indexes, and a last-index watermark.
pub struct Table<R> {
    env: Arc<Env>,
    name: &'static str,
    rows_db: String,
    meta_db: String,
    indexes: Vec<IndexSchema<R>>,
}

impl<R> Table<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Define a table. The schema must declare a unique "id" index (the
    /// primary key), and every virtual index must alias a declared real
    /// index.
    ///
    /// Panics on a malformed schema; table definitions are static program
    /// structure, not input.
    pub fn new(env: Arc<Env>, name: &'static str, mut indexes: Vec<IndexSchema<R>>) -> Self {
        for ix in &mut indexes {
            if ix.virtual_of.is_none() {
                ix.db_name = format!("{name}.ix.{}", ix.name);
            }
        }
        let table = Self {
            env,
            name,
            rows_db: name.to_string(),
            meta_db: meta_db_name(name),
            indexes,
        };
        let primary = table.schema("id");
        assert!(primary.unique, "table '{name}': primary index must be unique");
        for ix in &table.indexes {
            if let Some(real) = ix.virtual_of {
                assert!(
                    table
                        .indexes
                        .iter()
                        .any(|r| r.name == real && r.virtual_of.is_none()),
                    "table '{name}': virtual index '{}' aliases unknown index '{real}'",
                    ix.name,
                );
            }
        }
        table
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Create the table's sub-databases if absent. Must run inside a write
    /// transaction before any other operation touches the table.
    pub fn init(&self, txn: &Txn) -> StateResult<()> {
        let wt = txn.write()?;
        wt.open_table(rows_def(&self.rows_db))
            .map_err(map_err!(Table))?;
        wt.open_table(meta_def(&self.meta_db))
            .map_err(map_err!(Table))?;
        for ix in self.real_indexes() {
            wt.open_table(index_def(&ix.db_name))
                .map_err(map_err!(Table))?;
        }
        Ok(())
    }

    /// Start a transaction on the shared environment. To span several
    /// tables, start one transaction and pass it to each table's `*_txn`
    /// methods.
    pub fn start_txn(&self, readonly: bool) -> StateResult<Txn> {
        self.env.begin(readonly)
    }

    /// Insert a row, replacing any row with the same primary key. On
    /// replacement the old row's index entries are removed and its row-id
    /// is reused; otherwise a fresh row-id is allocated.
    pub fn insert_txn(&self, txn: &Txn, row: &R) -> StateResult<()> {
        let wt = txn.write()?;
        let primary = self.schema("id");
        let pkey = self.key_from_row(primary, row)?;

        let existing_id = {
            let tbl = wt
                .open_table(index_def(&primary.db_name))
                .map_err(map_err!(Table))?;
            let v = tbl
                .get(pkey.as_slice())
                .map_err(map_err!(Storage))?
                .map(|g| g.value());
            v
        };
        let old_row: Option<R> = match existing_id {
            Some(id) => {
                let rows = wt
                    .open_table(rows_def(&self.rows_db))
                    .map_err(map_err!(Table))?;
                let v = rows
                    .get(id)
                    .map_err(map_err!(Storage))?
                    .map(|g| codec::decode_record(g.value()));
                v
            }
            None => None,
        };
        let row_id = match existing_id {
            Some(id) => id,
            None => self.next_row_id(wt)?,
        };

        {
            let mut rows = wt
                .open_table(rows_def(&self.rows_db))
                .map_err(map_err!(Table))?;
            let buf = codec::encode_record(row);
            rows.insert(row_id, buf.as_slice())
                .map_err(map_err!(Storage))?;
        }
        for ix in self.real_indexes() {
            let mut tbl = wt
                .open_table(index_def(&ix.db_name))
                .map_err(map_err!(Table))?;
            if let Some(old) = &old_row {
                let old_key = self.entry_key(ix, old, row_id)?;
                tbl.remove(old_key.as_slice()).map_err(map_err!(Storage))?;
            }
            let new_key = self.entry_key(ix, row, row_id)?;
            tbl.insert(new_key.as_slice(), row_id)
                .map_err(map_err!(Storage))?;
        }
        Ok(())
    }

    /// Delete every row matched by the index lookup and return how many
    /// were removed. Fewer parts than index fields deletes the whole
    /// matching prefix.
    pub fn delete_txn(&self, txn: &Txn, index: &str, parts: &[&str]) -> StateResult<usize> {
        let wt = txn.write()?;
        let (target, lookup) = self.lookup(index, parts)?;
        let ids = {
            let tbl = wt
                .open_table(index_def(&target.db_name))
                .map_err(map_err!(Table))?;
            scan_ids(&tbl, &lookup)?
        };

        let mut removed: Vec<(u64, R)> = Vec::with_capacity(ids.len());
        {
            let mut rows = wt
                .open_table(rows_def(&self.rows_db))
                .map_err(map_err!(Table))?;
            for id in ids {
                if let Some(guard) = rows.remove(id).map_err(map_err!(Storage))? {
                    removed.push((id, codec::decode_record(guard.value())));
                }
            }
        }
        for ix in self.real_indexes() {
            let mut tbl = wt
                .open_table(index_def(&ix.db_name))
                .map_err(map_err!(Table))?;
            for (id, row) in &removed {
                let key = self.entry_key(ix, row, *id)?;
                tbl.remove(key.as_slice()).map_err(map_err!(Storage))?;
            }
        }
        Ok(removed.len())
    }

    /// Look up rows by index within an existing transaction. A unique
    /// index given all its fields yields at most one row; anything else is
    /// a prefix scan in ascending key order.
    pub fn get_txn(&self, txn: &Txn, index: &str, parts: &[&str]) -> StateResult<Vec<R>> {
        let (target, lookup) = self.lookup(index, parts)?;
        let ids = with_table!(txn, index_def(&target.db_name), |tbl| scan_ids(
            &tbl, &lookup
        ))?;
        self.fetch_rows(txn, &ids)
    }

    /// Like [`Table::get_txn`], but delivers decoded rows through a bounded
    /// channel and closes it on completion, so the caller can consume a
    /// large result without holding it all. Blocks while the channel is
    /// full; stops early if the receiver hangs up.
    pub fn stream_txn(
        &self,
        txn: &Txn,
        sender: SyncSender<R>,
        index: &str,
        parts: &[&str],
    ) -> StateResult<()> {
        let (target, lookup) = self.lookup(index, parts)?;
        let ids = with_table!(txn, index_def(&target.db_name), |tbl| scan_ids(
            &tbl, &lookup
        ))?;
        with_table!(txn, rows_def(&self.rows_db), |tbl| {
            for id in ids {
                if let Some(guard) = tbl.get(id).map_err(map_err!(Storage))? {
                    let row: R = codec::decode_record(guard.value());
                    drop(guard);
                    if sender.send(row).is_err() {
                        break;
                    }
                }
            }
            Ok(())
        })
    }

    /// Index lookup in a fresh read transaction, returning the table's
    /// watermark alongside the rows.
    pub fn get(&self, index: &str, parts: &[&str]) -> StateResult<(u64, Vec<R>)> {
        let txn = self.start_txn(true)?;
        let last = self.last_index_txn(&txn)?;
        let rows = self.get_txn(&txn, index, parts)?;
        Ok((last, rows))
    }

    /// The largest consensus index that has modified this table.
    pub fn last_index_txn(&self, txn: &Txn) -> StateResult<u64> {
        read_last_index(txn, &self.meta_db)
    }

    /// Record the consensus index of the write being applied.
    pub fn set_last_index_txn(&self, txn: &Txn, index: u64) -> StateResult<u64> {
        let wt = txn.write()?;
        let mut meta = wt
            .open_table(meta_def(&self.meta_db))
            .map_err(map_err!(Table))?;
        meta.insert(LAST_INDEX_KEY, index)
            .map_err(map_err!(Storage))?;
        Ok(index)
    }

    /// Advance the watermark only if `index` is beyond it. Restores replay
    /// records in arbitrary order, so an older entry must not rewind the
    /// table.
    pub fn set_max_last_index_txn(&self, txn: &Txn, index: u64) -> StateResult<u64> {
        let wt = txn.write()?;
        let mut meta = wt
            .open_table(meta_def(&self.meta_db))
            .map_err(map_err!(Table))?;
        let current = meta
            .get(LAST_INDEX_KEY)
            .map_err(map_err!(Storage))?
            .map(|g| g.value())
            .unwrap_or(0);
        if index > current {
            meta.insert(LAST_INDEX_KEY, index)
                .map_err(map_err!(Storage))?;
            Ok(index)
        } else {
            Ok(current)
        }
    }

    fn real_indexes(&self) -> impl Iterator<Item = &IndexSchema<R>> {
        self.indexes.iter().filter(|ix| ix.virtual_of.is_none())
    }

    /// Panics on an undeclared index name: that is a programming error in
    /// the caller, not a runtime condition.
    fn schema(&self, name: &str) -> &IndexSchema<R> {
        self.indexes
            .iter()
            .find(|ix| ix.name == name)
            .unwrap_or_else(|| panic!("table '{}' has no index '{name}'", self.name))
    }

    /// Resolve an index name to its storage schema and the lookup to run
    /// against it.
    fn lookup(&self, index: &str, parts: &[&str]) -> StateResult<(&IndexSchema<R>, Lookup)> {
        let ix = self.schema(index);
        if let Some(real) = ix.virtual_of {
            let real = self.schema(real);
            let key = self.key_from_parts(real, parts, true)?;
            return Ok((real, Lookup::Prefix(key)));
        }
        if ix.unique && parts.len() == ix.fields.len() {
            let key = self.key_from_parts(ix, parts, false)?;
            Ok((ix, Lookup::Point(key)))
        } else {
            let key = self.key_from_parts(ix, parts, false)?;
            Ok((ix, Lookup::Prefix(key)))
        }
    }

    fn key_from_row(&self, ix: &IndexSchema<R>, row: &R) -> StateResult<Vec<u8>> {
        let mut key = Vec::new();
        for field in &ix.fields {
            push_field(&mut key, field(row), ix.allow_blank, self.name, ix.name)?;
        }
        Ok(key)
    }

    /// Encode lookup parts. With `raw_tail` the final part is appended
    /// without a terminating separator, giving raw-prefix semantics for
    /// virtual indexes.
    fn key_from_parts(
        &self,
        ix: &IndexSchema<R>,
        parts: &[&str],
        raw_tail: bool,
    ) -> StateResult<Vec<u8>> {
        if parts.len() > ix.fields.len() {
            return Err(StateError::IndexKey(format!(
                "index '{}.{}' takes at most {} parts, got {}",
                self.name,
                ix.name,
                ix.fields.len(),
                parts.len()
            )));
        }
        let mut key = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if raw_tail && i + 1 == parts.len() {
                if part.as_bytes().contains(&SEP) {
                    return Err(StateError::IndexKey(format!(
                        "prefix for '{}.{}' contains the separator byte",
                        self.name, ix.name
                    )));
                }
                key.extend_from_slice(part.as_bytes());
            } else {
                push_field(&mut key, part, ix.allow_blank, self.name, ix.name)?;
            }
        }
        Ok(key)
    }

    fn entry_key(&self, ix: &IndexSchema<R>, row: &R, row_id: u64) -> StateResult<Vec<u8>> {
        let mut key = self.key_from_row(ix, row)?;
        if !ix.unique {
            key.extend_from_slice(&codec::row_id_bytes(row_id));
        }
        Ok(key)
    }

    fn fetch_rows(&self, txn: &Txn, ids: &[u64]) -> StateResult<Vec<R>> {
        with_table!(txn, rows_def(&self.rows_db), |tbl| {
            let mut rows = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(guard) = tbl.get(id).map_err(map_err!(Storage))? {
                    rows.push(codec::decode_record(guard.value()));
                }
            }
            Ok(rows)
        })
    }

    fn next_row_id(&self, wt: &WriteTransaction) -> StateResult<u64> {
        let mut meta = wt
            .open_table(meta_def(&self.meta_db))
            .map_err(map_err!(Table))?;
        let next = meta
            .get(ROW_COUNTER_KEY)
            .map_err(map_err!(Storage))?
            .map(|g| g.value())
            .unwrap_or(0)
            + 1;
        meta.insert(ROW_COUNTER_KEY, next)
            .map_err(map_err!(Storage))?;
        Ok(next)
    }
}

/// Watermark of a table by name, readable from any transaction.
pub(crate) fn read_last_index(txn: &Txn, meta_db: &str) -> StateResult<u64> {
    with_table!(txn, meta_def(meta_db), |tbl| {
        let v = tbl
            .get(LAST_INDEX_KEY)
            .map_err(map_err!(Storage))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(v)
    })
}

/// Max watermark across a group of tables observed at one snapshot. This
/// is the index a query over the group reports.
pub(crate) fn group_last_index(txn: &Txn, tables: &[&str]) -> StateResult<u64> {
    let mut max = 0;
    for table in tables {
        max = max.max(read_last_index(txn, &meta_db_name(table))?);
    }
    Ok(max)
}

fn push_field(
    key: &mut Vec<u8>,
    value: &str,
    allow_blank: bool,
    table: &str,
    index: &str,
) -> StateResult<()> {
    let bytes = value.as_bytes();
    if bytes.contains(&SEP) {
        return Err(StateError::IndexKey(format!(
            "field value for '{table}.{index}' contains the separator byte"
        )));
    }
    if bytes.contains(&BLANK) {
        return Err(StateError::IndexKey(format!(
            "field value for '{table}.{index}' contains the blank sentinel byte"
        )));
    }
    if bytes.is_empty() {
        if !allow_blank {
            return Err(StateError::IndexKey(format!(
                "blank field value for '{table}.{index}'"
            )));
        }
        key.push(BLANK);
    } else {
        key.extend_from_slice(bytes);
    }
    key.push(SEP);
    Ok(())
}

fn scan_ids<T>(tbl: &T, lookup: &Lookup) -> StateResult<Vec<u64>>
where
    T: ReadableTable<&'static [u8], u64>,
{
    match lookup {
        Lookup::Point(key) => Ok(tbl
            .get(key.as_slice())
            .map_err(map_err!(Storage))?
            .map(|g| g.value())
            .into_iter()
            .collect()),
        Lookup::Prefix(prefix) => {
            let end = codec::prefix_end(prefix);
            let start = Bound::Included(prefix.as_slice());
            let upper = match &end {
                Some(e) => Bound::Excluded(e.as_slice()),
                None => Bound::Unbounded,
            };
            let mut ids = Vec::new();
            for item in tbl
                .range::<&[u8]>((start, upper))
                .map_err(map_err!(Storage))?
            {
                let (_, value) = item.map_err(map_err!(Storage))?;
                ids.push(value.value());
            }
            Ok(ids)
        }
    }
}
