use crate::db;
use crate::error::{OrganizerError, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Organization,
    Term,
    Person,
    Room,
    Group,
    Event,
    Block,
    Unit,
    Instance,
}

#[derive(Clone, Copy)]
enum FieldType {
    Text,
    Integer,
}

struct Field {
    key: &'static str,
    column: &'static str,
    ty: FieldType,
    required: bool,
}

const fn text(key: &'static str, column: &'static str, required: bool) -> Field {
    Field {
        key,
        column,
        ty: FieldType::Text,
        required,
    }
}

const fn int(key: &'static str, column: &'static str, required: bool) -> Field {
    Field {
        key,
        column,
        ty: FieldType::Integer,
        required,
    }
}

const ORGANIZATION_FIELDS: &[Field] = &[text("code", "code", false), text("name", "name", false)];
const TERM_FIELDS: &[Field] = &[
    text("code", "code", false),
    text("name", "name", false),
    text("startDate", "start_date", false),
    text("endDate", "end_date", false),
];
const PERSON_FIELDS: &[Field] = &[
    text("code", "code", false),
    text("surname", "surname", false),
    text("forename", "forename", false),
];
const NAMED_FIELDS: &[Field] = &[text("code", "code", false), text("name", "name", false)];
const EVENT_FIELDS: &[Field] = &[
    text("code", "code", false),
    int("organizationId", "organization_id", false),
    text("name", "name", false),
];
const BLOCK_FIELDS: &[Field] = &[
    text("date", "date", true),
    text("startTime", "start_time", true),
    text("endTime", "end_time", true),
];
const UNIT_FIELDS: &[Field] = &[
    text("code", "code", false),
    int("organizationId", "organization_id", true),
    int("termId", "term_id", true),
];
const INSTANCE_FIELDS: &[Field] = &[
    text("code", "code", false),
    int("blockId", "block_id", false),
    int("eventId", "event_id", false),
    int("unitId", "unit_id", true),
    int("methodId", "method_id", false),
];

impl ResourceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "organizations" => Some(Self::Organization),
            "terms" => Some(Self::Term),
            "persons" => Some(Self::Person),
            "rooms" => Some(Self::Room),
            "groups" => Some(Self::Group),
            "events" => Some(Self::Event),
            "blocks" => Some(Self::Block),
            "units" => Some(Self::Unit),
            "instances" => Some(Self::Instance),
            _ => None,
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Organization => "organizations",
            Self::Term => "terms",
            Self::Person => "persons",
            Self::Room => "rooms",
            Self::Group => "groups",
            Self::Event => "events",
            Self::Block => "blocks",
            Self::Unit => "units",
            Self::Instance => "instances",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Term => "term",
            Self::Person => "person",
            Self::Room => "room",
            Self::Group => "group",
            Self::Event => "event",
            Self::Block => "block",
            Self::Unit => "unit",
            Self::Instance => "instance",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Group => "student_groups",
            other => other.plural(),
        }
    }

    fn fields(self) -> &'static [Field] {
        match self {
            Self::Organization => ORGANIZATION_FIELDS,
            Self::Term => TERM_FIELDS,
            Self::Person => PERSON_FIELDS,
            Self::Room | Self::Group => NAMED_FIELDS,
            Self::Event => EVENT_FIELDS,
            Self::Block => BLOCK_FIELDS,
            Self::Unit => UNIT_FIELDS,
            Self::Instance => INSTANCE_FIELDS,
        }
    }

    fn has_code(self) -> bool {
        self != Self::Block
    }

    /// Units and instances carry their own delta status.
    pub fn tracks_delta(self) -> bool {
        matches!(self, Self::Unit | Self::Instance)
    }
}

/// Where an instance lives: its unit and that unit's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceScope {
    pub unit_id: i64,
    pub organization_id: i64,
    pub term_id: i64,
}

/// Lookup interface the importer and merge coordinator consume. Resource
/// CRUD itself belongs to the host; this crate only needs to resolve codes
/// and check existence.
pub trait ResourceDirectory {
    fn resolve(&self, kind: ResourceKind, code: &str) -> Result<Option<i64>>;
    fn exists(&self, kind: ResourceKind, id: i64) -> Result<bool>;
    fn instance_scope(&self, instance_id: i64) -> Result<Option<InstanceScope>>;
}

pub struct SqliteDirectory<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDirectory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl ResourceDirectory for SqliteDirectory<'_> {
    fn resolve(&self, kind: ResourceKind, code: &str) -> Result<Option<i64>> {
        if !kind.has_code() {
            return Ok(None);
        }
        let sql = format!("SELECT id FROM {} WHERE code = ?", kind.table());
        Ok(self
            .conn
            .query_row(&sql, [code.trim()], |r| r.get(0))
            .optional()?)
    }

    fn exists(&self, kind: ResourceKind, id: i64) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", kind.table());
        let hit: Option<i64> = self.conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
        Ok(hit.is_some())
    }

    fn instance_scope(&self, instance_id: i64) -> Result<Option<InstanceScope>> {
        Ok(self
            .conn
            .query_row(
                "SELECT u.id, u.organization_id, u.term_id
                 FROM instances i JOIN units u ON u.id = i.unit_id
                 WHERE i.id = ?",
                [instance_id],
                |r| {
                    Ok(InstanceScope {
                        unit_id: r.get(0)?,
                        organization_id: r.get(1)?,
                        term_id: r.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}

fn json_to_sql(field: &Field, v: &Value) -> Result<SqlValue> {
    if v.is_null() {
        if field.required {
            return Err(OrganizerError::BadParams(format!("{} must not be null", field.key)));
        }
        return Ok(SqlValue::Null);
    }
    match field.ty {
        FieldType::Text => v
            .as_str()
            .map(|s| SqlValue::Text(s.trim().to_string()))
            .ok_or_else(|| OrganizerError::BadParams(format!("{} must be string", field.key))),
        FieldType::Integer => v
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| OrganizerError::BadParams(format!("{} must be integer", field.key))),
    }
}

fn sql_to_json(v: SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => json!(i),
        SqlValue::Real(f) => json!(f),
        SqlValue::Text(s) => json!(s),
        SqlValue::Blob(_) => Value::Null,
    }
}

fn select_columns(kind: ResourceKind) -> Vec<&'static str> {
    let mut cols = vec!["id"];
    cols.extend(kind.fields().iter().map(|f| f.column));
    if kind.tracks_delta() {
        cols.push("delta");
        cols.push("modified");
    }
    cols
}

fn row_to_json(kind: ResourceKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let mut obj = Map::new();
    obj.insert("id".into(), json!(row.get::<_, i64>(0)?));
    let mut idx = 1;
    for f in kind.fields() {
        obj.insert(f.key.into(), sql_to_json(row.get::<_, SqlValue>(idx)?));
        idx += 1;
    }
    if kind.tracks_delta() {
        obj.insert("status".into(), json!(row.get::<_, String>(idx)?));
        obj.insert("statusDate".into(), json!(row.get::<_, String>(idx + 1)?));
    }
    Ok(Value::Object(obj))
}

/// Creates or updates a resource from a JSON object of its fields. With an
/// `id` that exists only the supplied fields change; otherwise a row is
/// inserted (keeping the supplied `id` when there is one).
pub fn upsert(conn: &Connection, kind: ResourceKind, params: &Value) -> Result<i64> {
    let id = params.get("id").and_then(|v| v.as_i64());
    let dir = SqliteDirectory::new(conn);
    let exists = match id {
        Some(id) => dir.exists(kind, id)?,
        None => false,
    };

    let mut columns: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    for f in kind.fields() {
        match params.get(f.key) {
            Some(v) => {
                columns.push(f.column);
                values.push(json_to_sql(f, v)?);
            }
            None if f.required && !exists => {
                return Err(OrganizerError::BadParams(format!(
                    "missing {} for {}",
                    f.key,
                    kind.label()
                )));
            }
            None => {}
        }
    }

    if exists {
        let Some(id) = id else {
            return Err(OrganizerError::BadParams("missing id".into()));
        };
        if columns.is_empty() {
            return Ok(id);
        }
        let sets = columns
            .iter()
            .map(|c| format!("{} = ?", c))
            .collect::<Vec<_>>()
            .join(", ");
        values.push(SqlValue::Integer(id));
        let sql = format!("UPDATE {} SET {} WHERE id = ?", kind.table(), sets);
        conn.execute(&sql, params_from_iter(values))?;
        return Ok(id);
    }

    if let Some(id) = id {
        columns.insert(0, "id");
        values.insert(0, SqlValue::Integer(id));
    }
    if kind.tracks_delta() {
        // Resources enter the delta tables as `new`.
        columns.push("delta");
        values.push(SqlValue::Text("new".into()));
        columns.push("modified");
        values.push(SqlValue::Text(db::now_timestamp()));
    }
    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", kind.table())
    } else {
        format!(
            "INSERT INTO {}({}) VALUES({})",
            kind.table(),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        )
    };
    conn.execute(&sql, params_from_iter(values))?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, kind: ResourceKind, id: i64) -> Result<Value> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?",
        select_columns(kind).join(", "),
        kind.table()
    );
    conn.query_row(&sql, [id], |r| row_to_json(kind, r))
        .optional()?
        .ok_or_else(|| {
            OrganizerError::not_found(
                format!("{} {} not found", kind.label(), id),
                json!({ "kind": kind.plural(), "id": id }),
            )
        })
}

pub fn list(conn: &Connection, kind: ResourceKind) -> Result<Vec<Value>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY id",
        select_columns(kind).join(", "),
        kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| row_to_json(kind, r))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete(conn: &Connection, kind: ResourceKind, id: i64) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?", kind.table());
    match conn.execute(&sql, [id]) {
        Ok(n) => Ok(n > 0),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(OrganizerError::integrity(
                format!("{} {} is still referenced", kind.label(), id),
                json!({ "kind": kind.plural(), "id": id }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}
