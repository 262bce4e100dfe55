//! Relational snapshot codec
//!
//! Bridges a SQLite store and the `database.content` part of a backup
//! document. Content is a sequence of table dumps:
//!
//! ```json
//! {"name":"scores","sql":"CREATE TABLE scores (...)","columns":["id","points"],
//!  "rows":[[1,20],[2,null]],"objects":["CREATE INDEX ..."]}
//! ```
//!
//! Tables come in creation order and rows in rowid order; generated columns
//! are recomputed and not stored. The keys of a table dump must appear in the
//! order shown, because rows are replayed into the staging store while the
//! document is still being read. An AUTOINCREMENT table adds `"seq":N`
//! between `rows` and `objects`. `objects` (indexes and triggers) is
//! optional on read.
//!
//! Views follow the tables as dumps with empty `columns` and `rows`; their
//! `objects` are the triggers on the view. They are created only after every
//! table of the document exists.
//!
//! Cells map to SQLite storage classes: `null`, integer, float, string,
//! `{"blob":"<base64>"}`, and `{"real":"inf"|"-inf"|"nan"}` for reals JSON
//! numbers can't express.

use std::cell::{Cell, RefCell};
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Statement, ToSql};
use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{BackupError, BackupResult};

use super::document::ErrorSlot;

const BLOB_KEY: &str = "blob";
const SEQ_KEY: &str = "seq";
const OBJECTS_KEY: &str = "objects";
const REAL_KEY: &str = "real";

/// One SQLite value
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl CellValue {
    fn from_value_ref(value: ValueRef<'_>) -> BackupResult<Self> {
        Ok(match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(f) => CellValue::Real(f),
            ValueRef::Text(bytes) => CellValue::Text(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| BackupError::Storage(format!("Text cell is not UTF-8: {}", e)))?,
            ),
            ValueRef::Blob(bytes) => CellValue::Blob(bytes.to_vec()),
        })
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            CellValue::Null => ValueRef::Null,
            CellValue::Integer(i) => ValueRef::Integer(*i),
            CellValue::Real(f) => ValueRef::Real(*f),
            CellValue::Text(s) => ValueRef::Text(s.as_bytes()),
            CellValue::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Integer(i) => serializer.serialize_i64(*i),
            CellValue::Real(f) if f.is_finite() => serializer.serialize_f64(*f),
            CellValue::Real(f) => {
                let tag = if f.is_nan() {
                    "nan"
                } else if f.is_sign_negative() {
                    "-inf"
                } else {
                    "inf"
                };
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REAL_KEY, tag)?;
                map.end()
            }
            CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Blob(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BLOB_KEY, &STANDARD.encode(b))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CellVisitor)
    }
}

struct CellVisitor;

impl<'de> Visitor<'de> for CellVisitor {
    type Value = CellValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("null, a number, a string, or a tagged blob/real object")
    }

    fn visit_unit<E: de::Error>(self) -> Result<CellValue, E> {
        Ok(CellValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<CellValue, E> {
        Ok(CellValue::Null)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<CellValue, E> {
        Ok(CellValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<CellValue, E> {
        i64::try_from(v)
            .map(CellValue::Integer)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<CellValue, E> {
        Ok(CellValue::Real(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<CellValue, E> {
        Ok(CellValue::Text(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<CellValue, E> {
        Ok(CellValue::Text(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<CellValue, A::Error> {
        let Some(key) = map.next_key::<String>()? else {
            return Err(de::Error::custom("empty object is not a cell"));
        };
        let value: String = map.next_value()?;

        let cell = match key.as_str() {
            BLOB_KEY => match STANDARD.decode(value.as_bytes()) {
                Ok(bytes) => CellValue::Blob(bytes),
                Err(e) => return Err(de::Error::custom(format!("invalid blob: {}", e))),
            },
            REAL_KEY => match value.as_str() {
                "inf" => CellValue::Real(f64::INFINITY),
                "-inf" => CellValue::Real(f64::NEG_INFINITY),
                "nan" => CellValue::Real(f64::NAN),
                other => return Err(de::Error::custom(format!("invalid real '{}'", other))),
            },
            other => return Err(de::Error::unknown_field(other, &[BLOB_KEY, REAL_KEY])),
        };

        if map.next_key::<String>()?.is_some() {
            return Err(de::Error::custom("tagged cell must have exactly one key"));
        }
        Ok(cell)
    }
}

/// Full dump of one table or view
///
/// A view carries no columns or rows; its `objects` are the triggers
/// attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub name: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// AUTOINCREMENT high-water mark from `sqlite_sequence`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default)]
    pub objects: Vec<String>,
}

impl TableDump {
    pub fn is_view(&self) -> bool {
        is_view_sql(&self.sql)
    }
}

/// Every user table of a store in creation order, then every view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationalSnapshot {
    pub tables: Vec<TableDump>,
}

/// Schema entry of a user table or view
#[derive(Debug, Clone)]
struct TableSchema {
    name: String,
    sql: String,
}

impl TableSchema {
    fn is_view(&self) -> bool {
        is_view_sql(&self.sql)
    }

    fn without_rowid(&self) -> bool {
        self.sql.to_ascii_uppercase().contains("WITHOUT ROWID")
    }

    fn select_sql(&self, columns: &[String]) -> String {
        let order = if self.without_rowid() {
            ""
        } else {
            " ORDER BY rowid"
        };
        format!(
            "SELECT {} FROM {}{}",
            quoted_list(columns),
            quote_ident(&self.name),
            order
        )
    }
}

/// Read every user table and view of `conn`
pub fn read_all(conn: &Connection) -> BackupResult<RelationalSnapshot> {
    let mut tables = Vec::new();

    for schema in list_schema(conn)? {
        let objects = list_objects(conn, &schema.name)?;
        if schema.is_view() {
            tables.push(TableDump {
                name: schema.name,
                sql: schema.sql,
                columns: Vec::new(),
                rows: Vec::new(),
                seq: None,
                objects,
            });
            continue;
        }

        let columns = stored_columns(conn, &schema.name)?;
        let mut stmt = conn.prepare(&schema.select_sql(&columns))?;
        let mut rows = Vec::new();

        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            rows.push(read_row(row, columns.len())?);
        }

        let seq = table_sequence(conn, &schema.name)?;
        tables.push(TableDump {
            name: schema.name,
            sql: schema.sql,
            columns,
            rows,
            seq,
            objects,
        });
    }

    Ok(RelationalSnapshot { tables })
}

/// Recreate every table of `snapshot` in `conn`, then its views
///
/// Run this inside a transaction; a failure leaves partial tables behind.
pub fn write_all(conn: &Connection, snapshot: &RelationalSnapshot) -> BackupResult<()> {
    let (views, tables): (Vec<_>, Vec<_>) = snapshot.tables.iter().partition(|t| t.is_view());

    for table in tables {
        create_table(conn, &table.name, &table.sql)?;

        let mut insert = prepare_insert(conn, &table.name, &table.columns)?;
        for row in &table.rows {
            insert_row(&mut insert, &table.name, table.columns.len(), row)?;
        }
        drop(insert);

        if let Some(seq) = table.seq {
            set_sequence(conn, &table.name, &table.sql, seq)?;
        }
        for object in &table.objects {
            create_object(conn, &table.name, object)?;
        }
    }

    for view in views {
        if !view.columns.is_empty() || !view.rows.is_empty() || view.seq.is_some() {
            return Err(view_with_data(&view.name));
        }
        create_view(conn, view)?;
    }
    Ok(())
}

fn is_view_sql(sql: &str) -> bool {
    starts_with_words(sql, &["CREATE", "VIEW"])
}

/// Tables in creation order followed by views in creation order
fn list_schema(conn: &Connection) -> BackupResult<Vec<TableSchema>> {
    let mut entries = list_entries(conn, "table")?;
    entries.extend(list_entries(conn, "view")?);
    Ok(entries)
}

fn list_entries(conn: &Connection, kind: &str) -> BackupResult<Vec<TableSchema>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = ?1 AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         ORDER BY rowid",
    )?;
    let entries = stmt
        .query_map([kind], |row| {
            Ok(TableSchema {
                name: row.get(0)?,
                sql: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn list_objects(conn: &Connection, table: &str) -> BackupResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master \
         WHERE type IN ('index', 'trigger') AND tbl_name = ?1 AND sql IS NOT NULL \
         ORDER BY rowid",
    )?;
    let objects = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(objects)
}

/// Columns that hold stored values; generated columns are left out
fn stored_columns(conn: &Connection, table: &str) -> BackupResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_xinfo(?1) WHERE hidden NOT IN (2, 3) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(columns)
}

fn has_sequence_table(conn: &Connection) -> BackupResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence')",
        [],
        |row| row.get(0),
    )?)
}

fn table_sequence(conn: &Connection, table: &str) -> BackupResult<Option<i64>> {
    if !has_sequence_table(conn)? {
        return Ok(None);
    }
    Ok(conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?)
}

/// Restore the AUTOINCREMENT high-water mark of `table`
fn set_sequence(conn: &Connection, table: &str, sql: &str, seq: i64) -> BackupResult<()> {
    if !sql.to_ascii_uppercase().contains("AUTOINCREMENT") || !has_sequence_table(conn)? {
        return Err(BackupError::structural(format!(
            "Table '{}' has a sequence but no AUTOINCREMENT key",
            table
        )));
    }

    let updated = conn.execute(
        "UPDATE sqlite_sequence SET seq = ?2 WHERE name = ?1",
        params![table, seq],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
            params![table, seq],
        )?;
    }
    Ok(())
}

fn read_row(row: &Row<'_>, width: usize) -> BackupResult<Vec<CellValue>> {
    (0..width)
        .map(|i| CellValue::from_value_ref(row.get_ref(i)?))
        .collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn starts_with_words(sql: &str, words: &[&str]) -> bool {
    let mut tokens = sql.split_whitespace();
    words
        .iter()
        .all(|w| tokens.next().is_some_and(|t| t.eq_ignore_ascii_case(w)))
}

fn create_table(conn: &Connection, name: &str, sql: &str) -> BackupResult<()> {
    create_named(conn, "table", name, sql)
}

fn create_view(conn: &Connection, view: &TableDump) -> BackupResult<()> {
    create_named(conn, "view", &view.name, &view.sql)?;
    for object in &view.objects {
        create_object(conn, &view.name, object)?;
    }
    Ok(())
}

/// Run a `CREATE TABLE` or `CREATE VIEW` statement that must create `name`
fn create_named(conn: &Connection, kind: &str, name: &str, sql: &str) -> BackupResult<()> {
    if !starts_with_words(sql, &["CREATE", kind]) {
        return Err(BackupError::structural(format!(
            "No CREATE {} statement for {} '{}'",
            kind.to_ascii_uppercase(),
            kind,
            name
        )));
    }

    // `execute` refuses trailing statements
    conn.execute(sql, [])?;

    let created: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
        [kind, name],
        |row| row.get(0),
    )?;
    if !created {
        return Err(BackupError::structural(format!(
            "Statement for {} '{}' created something else",
            kind, name
        )));
    }
    Ok(())
}

fn create_object(conn: &Connection, table: &str, sql: &str) -> BackupResult<()> {
    let allowed = starts_with_words(sql, &["CREATE", "INDEX"])
        || starts_with_words(sql, &["CREATE", "UNIQUE", "INDEX"])
        || starts_with_words(sql, &["CREATE", "TRIGGER"]);
    if !allowed {
        return Err(BackupError::structural(format!(
            "Unsupported schema object for table '{}'",
            table
        )));
    }

    conn.execute(sql, [])?;
    Ok(())
}

fn prepare_insert<'c>(
    conn: &'c Connection,
    table: &str,
    columns: &[String],
) -> BackupResult<Statement<'c>> {
    if columns.is_empty() {
        return Err(BackupError::structural(format!(
            "Table '{}' lists no columns",
            table
        )));
    }

    let params = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        quoted_list(columns),
        params
    );
    Ok(conn.prepare(&sql)?)
}

fn insert_row(
    insert: &mut Statement<'_>,
    table: &str,
    width: usize,
    row: &[CellValue],
) -> BackupResult<()> {
    if row.len() != width {
        return Err(BackupError::structural(format!(
            "Row in table '{}' has {} cells, expected {}",
            table,
            row.len(),
            width
        )));
    }
    insert.execute(params_from_iter(row.iter()))?;
    Ok(())
}

fn view_with_data(view: &str) -> BackupError {
    BackupError::structural(format!("View '{}' can not hold columns, rows or a sequence", view))
}

// --- streaming export ---

/// Running totals of a streamed snapshot
#[derive(Debug, Default)]
pub struct SnapshotCounter {
    tables: Cell<usize>,
    rows: Cell<usize>,
}

impl SnapshotCounter {
    /// Tables written, views not included
    pub fn tables(&self) -> usize {
        self.tables.get()
    }

    pub fn rows(&self) -> usize {
        self.rows.get()
    }
}

/// Serializes `database.content` straight from a connection
pub struct ContentWriter<'a> {
    conn: &'a Connection,
    counter: &'a SnapshotCounter,
}

impl<'a> ContentWriter<'a> {
    pub fn new(conn: &'a Connection, counter: &'a SnapshotCounter) -> Self {
        Self { conn, counter }
    }
}

impl Serialize for ContentWriter<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = list_schema(self.conn).map_err(<S::Error as ser::Error>::custom)?;
        let mut seq = serializer.serialize_seq(Some(entries.len()))?;
        for schema in &entries {
            seq.serialize_element(&TableWriter {
                conn: self.conn,
                schema,
                counter: self.counter,
            })?;
            if !schema.is_view() {
                self.counter.tables.set(self.counter.tables.get() + 1);
            }
        }
        seq.end()
    }
}

struct TableWriter<'a> {
    conn: &'a Connection,
    schema: &'a TableSchema,
    counter: &'a SnapshotCounter,
}

impl Serialize for TableWriter<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let objects =
            list_objects(self.conn, &self.schema.name).map_err(<S::Error as ser::Error>::custom)?;

        let mut dump = serializer.serialize_struct("TableDump", 6)?;
        dump.serialize_field("name", &self.schema.name)?;
        dump.serialize_field("sql", &self.schema.sql)?;

        if self.schema.is_view() {
            dump.serialize_field("columns", &[] as &[String])?;
            dump.serialize_field("rows", &[] as &[Vec<CellValue>])?;
            dump.skip_field(SEQ_KEY)?;
        } else {
            let columns = stored_columns(self.conn, &self.schema.name)
                .map_err(<S::Error as ser::Error>::custom)?;
            let mut stmt = self
                .conn
                .prepare(&self.schema.select_sql(&columns))
                .map_err(<S::Error as ser::Error>::custom)?;
            let seq = table_sequence(self.conn, &self.schema.name)
                .map_err(<S::Error as ser::Error>::custom)?;

            dump.serialize_field("columns", &columns)?;
            dump.serialize_field(
                "rows",
                &RowsWriter {
                    stmt: RefCell::new(&mut stmt),
                    width: columns.len(),
                    counter: self.counter,
                },
            )?;
            match seq {
                Some(seq) => dump.serialize_field(SEQ_KEY, &seq)?,
                None => dump.skip_field(SEQ_KEY)?,
            }
        }

        dump.serialize_field(OBJECTS_KEY, &objects)?;
        debug!(entry = %self.schema.name, "Exported schema entry");
        dump.end()
    }
}

struct RowsWriter<'s, 'c> {
    stmt: RefCell<&'s mut Statement<'c>>,
    width: usize,
    counter: &'s SnapshotCounter,
}

impl Serialize for RowsWriter<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut stmt = self.stmt.borrow_mut();
        let mut cursor = stmt
            .query([])
            .map_err(<S::Error as ser::Error>::custom)?;

        let mut seq = serializer.serialize_seq(None)?;
        while let Some(row) = cursor.next().map_err(<S::Error as ser::Error>::custom)? {
            let cells = read_row(row, self.width).map_err(<S::Error as ser::Error>::custom)?;
            seq.serialize_element(&cells)?;
            self.counter.rows.set(self.counter.rows.get() + 1);
        }
        seq.end()
    }
}

// --- streaming restore ---

/// Running totals of a replayed snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub tables: usize,
    pub rows: usize,
}

/// Replays `database.content` into `conn` while it is being read
///
/// Views are held back and created once every table exists.
pub struct ContentSeed<'a> {
    conn: &'a Connection,
    slot: &'a mut ErrorSlot,
    stats: &'a mut ReplayStats,
}

impl<'a> ContentSeed<'a> {
    pub fn new(conn: &'a Connection, slot: &'a mut ErrorSlot, stats: &'a mut ReplayStats) -> Self {
        Self { conn, slot, stats }
    }
}

impl<'de> DeserializeSeed<'de> for ContentSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ContentSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of table dumps")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let ContentSeed { conn, slot, stats } = self;

        let mut views = Vec::new();
        while let Some(entry) = seq.next_element_seed(TableSeed {
            conn,
            slot: &mut *slot,
            stats: &mut *stats,
        })? {
            views.extend(entry);
        }

        for view in &views {
            create_view(conn, view).map_err(|e| slot.raise::<A::Error>(e))?;
            debug!(view = %view.name, "Replayed view");
        }
        Ok(())
    }
}

struct TableSeed<'a> {
    conn: &'a Connection,
    slot: &'a mut ErrorSlot,
    stats: &'a mut ReplayStats,
}

impl<'de> DeserializeSeed<'de> for TableSeed<'_> {
    type Value = Option<TableDump>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TableSeed<'_> {
    /// A view to create after all tables
    type Value = Option<TableDump>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a table dump object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let TableSeed { conn, slot, stats } = self;

        slot.expect_key(&mut map, "name")?;
        let name: String = map.next_value()?;
        slot.expect_key(&mut map, "sql")?;
        let sql: String = map.next_value()?;

        if is_view_sql(&sql) {
            slot.expect_key(&mut map, "columns")?;
            let columns: Vec<String> = map.next_value()?;
            slot.expect_key(&mut map, "rows")?;
            let rows: Vec<Vec<CellValue>> = map.next_value()?;
            let (seq, objects) = read_trailer(&mut map, slot, &name)?;
            if !columns.is_empty() || !rows.is_empty() || seq.is_some() {
                return Err(slot.raise(view_with_data(&name)));
            }

            return Ok(Some(TableDump {
                name,
                sql,
                columns,
                rows,
                seq,
                objects,
            }));
        }

        create_table(conn, &name, &sql).map_err(|e| slot.raise::<A::Error>(e))?;

        slot.expect_key(&mut map, "columns")?;
        let columns: Vec<String> = map.next_value()?;
        let mut insert =
            prepare_insert(conn, &name, &columns).map_err(|e| slot.raise::<A::Error>(e))?;

        slot.expect_key(&mut map, "rows")?;
        let before = stats.rows;
        map.next_value_seed(RowsSeed {
            insert: &mut insert,
            table: &name,
            width: columns.len(),
            slot: &mut *slot,
            stats: &mut *stats,
        })?;
        drop(insert);

        let (seq, objects) = read_trailer(&mut map, slot, &name)?;
        if let Some(seq) = seq {
            set_sequence(conn, &name, &sql, seq).map_err(|e| slot.raise::<A::Error>(e))?;
        }
        for object in &objects {
            create_object(conn, &name, object).map_err(|e| slot.raise::<A::Error>(e))?;
        }

        stats.tables += 1;
        debug!(table = %name, rows = stats.rows - before, "Replayed table");
        Ok(None)
    }
}

/// Read the optional `seq` and `objects` keys that close a table dump
fn read_trailer<'de, A: MapAccess<'de>>(
    map: &mut A,
    slot: &mut ErrorSlot,
    table: &str,
) -> Result<(Option<i64>, Vec<String>), A::Error> {
    let mut next = map.next_key::<String>()?;

    let mut seq = None;
    if next.as_deref() == Some(SEQ_KEY) {
        seq = Some(map.next_value::<i64>()?);
        next = map.next_key::<String>()?;
    }

    let mut objects = Vec::new();
    if next.as_deref() == Some(OBJECTS_KEY) {
        objects = map.next_value()?;
        next = map.next_key::<String>()?;
    }

    match next {
        Some(key) => Err(slot.raise(unexpected_table_key(table, &key))),
        None => Ok((seq, objects)),
    }
}

fn unexpected_table_key(table: &str, key: &str) -> BackupError {
    BackupError::structural(format!("Unknown key '{}' in table '{}'", key, table))
}

struct RowsSeed<'a, 'c> {
    insert: &'a mut Statement<'c>,
    table: &'a str,
    width: usize,
    slot: &'a mut ErrorSlot,
    stats: &'a mut ReplayStats,
}

impl<'de> DeserializeSeed<'de> for RowsSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RowsSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of rows")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let RowsSeed {
            insert,
            table,
            width,
            slot,
            stats,
        } = self;
        while let Some(row) = seq.next_element::<Vec<CellValue>>()? {
            insert_row(insert, table, width, &row).map_err(|e| slot.raise::<A::Error>(e))?;
            stats.rows += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE games (id INTEGER PRIMARY KEY AUTOINCREMENT, mode TEXT NOT NULL, score REAL, raw BLOB);
             CREATE INDEX idx_games_mode ON games(mode);
             CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT) WITHOUT ROWID;
             INSERT INTO games (mode, score, raw) VALUES ('add', 1.5, x'00ff');
             INSERT INTO games (mode, score, raw) VALUES ('sub', NULL, NULL);
             INSERT INTO games (mode, score, raw) VALUES ('mul', 3.0, x'');
             INSERT INTO settings VALUES ('level', '3');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_read_all_preserves_order_and_types() {
        let snapshot = read_all(&sample_store()).unwrap();

        let names: Vec<_> = snapshot.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["games", "settings"]);

        let games = &snapshot.tables[0];
        assert_eq!(games.columns, ["id", "mode", "score", "raw"]);
        assert_eq!(games.rows.len(), 3);
        assert_eq!(
            games.rows[0],
            vec![
                CellValue::Integer(1),
                CellValue::Text("add".into()),
                CellValue::Real(1.5),
                CellValue::Blob(vec![0x00, 0xff]),
            ]
        );
        assert_eq!(games.rows[1][2], CellValue::Null);
        assert_eq!(games.objects.len(), 1);
        assert!(games.objects[0].contains("idx_games_mode"));
    }

    #[test]
    fn test_write_all_reproduces_snapshot() {
        let snapshot = read_all(&sample_store()).unwrap();

        let mut target = Connection::open_in_memory().unwrap();
        let tx = target.transaction().unwrap();
        write_all(&tx, &snapshot).unwrap();
        tx.commit().unwrap();

        assert_eq!(read_all(&target).unwrap(), snapshot);
    }

    #[test]
    fn test_cell_json_encoding() {
        let row = vec![
            CellValue::Null,
            CellValue::Integer(-3),
            CellValue::Real(3.0),
            CellValue::Text("x".into()),
            CellValue::Blob(vec![1, 2, 3]),
            CellValue::Real(f64::NEG_INFINITY),
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(
            json,
            r#"[null,-3,3.0,"x",{"blob":"AQID"},{"real":"-inf"}]"#
        );

        let back: Vec<CellValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_cell_rejects_unknown_shapes() {
        assert!(serde_json::from_str::<CellValue>("true").is_err());
        assert!(serde_json::from_str::<CellValue>(r#"{"text":"x"}"#).is_err());
        assert!(serde_json::from_str::<CellValue>(r#"{"blob":"not base64!"}"#).is_err());
        assert!(serde_json::from_str::<CellValue>(r#"{"blob":"AA==","real":"inf"}"#).is_err());
    }

    #[test]
    fn test_streamed_content_matches_materialized() {
        let conn = sample_store();
        let counter = SnapshotCounter::default();

        let streamed = serde_json::to_string(&ContentWriter::new(&conn, &counter)).unwrap();
        let materialized = serde_json::to_string(&read_all(&conn).unwrap()).unwrap();

        assert_eq!(streamed, materialized);
        assert_eq!(counter.tables(), 2);
        assert_eq!(counter.rows(), 4);
    }

    #[test]
    fn test_content_seed_replays_rows() {
        let source = sample_store();
        let json = serde_json::to_string(&read_all(&source).unwrap()).unwrap();

        let target = Connection::open_in_memory().unwrap();
        let mut slot = ErrorSlot::default();
        let mut stats = ReplayStats::default();
        let mut de = serde_json::Deserializer::from_str(&json);
        ContentSeed::new(&target, &mut slot, &mut stats)
            .deserialize(&mut de)
            .unwrap();

        assert_eq!(stats.tables, 2);
        assert_eq!(stats.rows, 4);
        assert_eq!(read_all(&target).unwrap(), read_all(&source).unwrap());
    }

    #[test]
    fn test_content_seed_rejects_short_row() {
        let json = r#"[{"name":"t","sql":"CREATE TABLE t (a, b)","columns":["a","b"],"rows":[[1,2],[3]]}]"#;

        let target = Connection::open_in_memory().unwrap();
        let mut slot = ErrorSlot::default();
        let mut stats = ReplayStats::default();
        let mut de = serde_json::Deserializer::from_str(json);
        let err = ContentSeed::new(&target, &mut slot, &mut stats)
            .deserialize(&mut de)
            .unwrap_err();

        assert!(slot.resolve(err).is_structural());
        assert_eq!(stats.rows, 1);
    }

    #[test]
    fn test_content_seed_requires_key_order() {
        let json = r#"[{"sql":"CREATE TABLE t (a)","name":"t","columns":["a"],"rows":[]}]"#;

        let target = Connection::open_in_memory().unwrap();
        let mut slot = ErrorSlot::default();
        let mut stats = ReplayStats::default();
        let mut de = serde_json::Deserializer::from_str(json);
        let err = ContentSeed::new(&target, &mut slot, &mut stats)
            .deserialize(&mut de)
            .unwrap_err();

        assert!(slot.resolve(err).is_structural());
    }

    fn replay(target: &Connection, json: &str) -> Result<ReplayStats, BackupError> {
        let mut slot = ErrorSlot::default();
        let mut stats = ReplayStats::default();
        let mut de = serde_json::Deserializer::from_str(json);
        ContentSeed::new(target, &mut slot, &mut stats)
            .deserialize(&mut de)
            .map_err(|e| slot.resolve(e))?;
        Ok(stats)
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_views_and_view_triggers_round_trip() {
        let source = Connection::open_in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE answers (id INTEGER PRIMARY KEY, value INTEGER);
                 CREATE VIEW big_answers AS SELECT id, value FROM answers WHERE value > 10;
                 CREATE TRIGGER big_answers_insert INSTEAD OF INSERT ON big_answers
                 BEGIN INSERT INTO answers (value) VALUES (NEW.value); END;
                 INSERT INTO answers (value) VALUES (5), (50);",
            )
            .unwrap();

        let snapshot = read_all(&source).unwrap();
        let view = &snapshot.tables[1];
        assert!(view.is_view());
        assert!(view.columns.is_empty() && view.rows.is_empty());
        assert_eq!(view.objects.len(), 1);

        let target = Connection::open_in_memory().unwrap();
        let json = serde_json::to_string(&ContentWriter::new(&source, &SnapshotCounter::default()))
            .unwrap();
        let stats = replay(&target, &json).unwrap();

        assert_eq!(stats.tables, 1);
        assert_eq!(read_all(&target).unwrap(), snapshot);
        assert_eq!(count(&target, "SELECT COUNT(*) FROM big_answers"), 1);
        target
            .execute("INSERT INTO big_answers (value) VALUES (70)", [])
            .unwrap();
        assert_eq!(count(&target, "SELECT COUNT(*) FROM answers"), 3);
    }

    #[test]
    fn test_views_wait_for_later_tables() {
        let json = r#"[
            {"name":"v","sql":"CREATE VIEW v AS SELECT a FROM t","columns":[],"rows":[],"objects":[]},
            {"name":"t","sql":"CREATE TABLE t (a)","columns":["a"],"rows":[[1]]}
        ]"#;

        let target = Connection::open_in_memory().unwrap();
        replay(&target, json).unwrap();

        assert_eq!(count(&target, "SELECT COUNT(*) FROM v"), 1);
    }

    #[test]
    fn test_view_with_rows_rejected() {
        let json = r#"[{"name":"v","sql":"CREATE VIEW v AS SELECT 1","columns":["a"],"rows":[[1]]}]"#;

        let target = Connection::open_in_memory().unwrap();
        assert!(replay(&target, json).unwrap_err().is_structural());
        assert_eq!(count(&target, "SELECT COUNT(*) FROM sqlite_master"), 0);
    }

    #[test]
    fn test_autoincrement_sequence_survives_round_trip() {
        let source = Connection::open_in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE rounds (id INTEGER PRIMARY KEY AUTOINCREMENT, score INTEGER);
                 INSERT INTO rounds (score) VALUES (1), (2), (3);
                 DELETE FROM rounds WHERE id = 3;",
            )
            .unwrap();

        let snapshot = read_all(&source).unwrap();
        assert_eq!(snapshot.tables[0].seq, Some(3));

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""rows":[[1,1],[2,2]],"seq":3,"objects":[]"#));

        let target = Connection::open_in_memory().unwrap();
        replay(&target, &json).unwrap();
        target
            .execute("INSERT INTO rounds (score) VALUES (4)", [])
            .unwrap();

        assert_eq!(count(&target, "SELECT MAX(id) FROM rounds"), 4);
    }

    #[test]
    fn test_sequence_requires_autoincrement() {
        let json = r#"[{"name":"t","sql":"CREATE TABLE t (id INTEGER PRIMARY KEY)","columns":["id"],"rows":[],"seq":9}]"#;

        let target = Connection::open_in_memory().unwrap();
        assert!(replay(&target, json).unwrap_err().is_structural());
    }

    #[test]
    fn test_generated_columns_are_recomputed() {
        let source = Connection::open_in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE sums (a INTEGER, b INTEGER GENERATED ALWAYS AS (a * 2) VIRTUAL,
                                    c INTEGER GENERATED ALWAYS AS (a + 1) STORED);
                 INSERT INTO sums (a) VALUES (1), (5);",
            )
            .unwrap();

        let snapshot = read_all(&source).unwrap();
        assert_eq!(snapshot.tables[0].columns, ["a"]);
        assert_eq!(
            snapshot.tables[0].rows,
            vec![vec![CellValue::Integer(1)], vec![CellValue::Integer(5)]]
        );

        let target = Connection::open_in_memory().unwrap();
        let json = serde_json::to_string(&ContentWriter::new(&source, &SnapshotCounter::default()))
            .unwrap();
        replay(&target, &json).unwrap();

        assert_eq!(read_all(&target).unwrap(), snapshot);
        assert_eq!(count(&target, "SELECT SUM(b) + SUM(c) FROM sums"), 20);
    }

    #[test]
    fn test_write_all_creates_views_last() {
        let source = Connection::open_in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE t (a);
                 CREATE VIEW v AS SELECT a FROM t;
                 INSERT INTO t VALUES (1);",
            )
            .unwrap();
        let mut snapshot = read_all(&source).unwrap();
        snapshot.tables.reverse();

        let target = Connection::open_in_memory().unwrap();
        write_all(&target, &snapshot).unwrap();

        assert_eq!(count(&target, "SELECT COUNT(*) FROM v"), 1);
    }

    #[test]
    fn test_rejects_non_create_statements() {
        let conn = Connection::open_in_memory().unwrap();

        let err = create_table(&conn, "t", "DROP TABLE t").unwrap_err();
        assert!(err.is_structural());

        let err = create_table(&conn, "t", "CREATE TABLE t (a); CREATE TABLE u (b)").unwrap_err();
        assert!(err.is_storage());

        let err = create_table(&conn, "t", "CREATE TABLE other (a)").unwrap_err();
        assert!(err.is_structural());

        let err = create_object(&conn, "other", "ATTACH DATABASE 'x' AS y").unwrap_err();
        assert!(err.is_structural());
    }
}
