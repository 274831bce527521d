use std::collections::HashMap;

use base64::Engine as _;
use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{
    AccountChanges, NewAccount, NewAttachment, NewRoom, NewTicket, PassChanges, PassFilter, PassRequest,
    RoomChanges, RoomFilter, TicketFilter,
};
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Occupancy,
    Passes,
    Maintenance,
    Accounts,
    /// All four as one JSON document.
    Export,
}

/// Parsed command from SQL input.
#[derive(Debug)]
pub enum Command {
    InsertAccount(NewAccount),
    UpdateAccountStatus {
        id: Ulid,
        status: AccountStatus,
        reason: Option<String>,
    },
    UpdateAccount {
        id: Ulid,
        changes: AccountChanges,
    },
    DeleteAccount {
        id: Ulid,
    },
    SelectAccounts {
        role: Option<Role>,
        status: Option<AccountStatus>,
    },
    InsertRoom(NewRoom),
    UpdateRoom {
        id: Ulid,
        changes: RoomChanges,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms(RoomFilter),
    AssignResident {
        student_id: Ulid,
        room_id: Ulid,
    },
    RemoveResident {
        student_id: Ulid,
        room_id: Option<Ulid>,
    },
    ResetRoom {
        room_id: Ulid,
    },
    InsertPass(PassRequest),
    EditPass {
        id: Ulid,
        changes: PassChanges,
    },
    ResolvePass {
        id: Ulid,
        status: PassStatus,
        comments: Option<String>,
    },
    DeletePass {
        id: Ulid,
    },
    SelectPasses(PassFilter),
    InsertBlacklist {
        id_number: String,
        reason: Option<String>,
    },
    DeleteBlacklist {
        id_number: String,
    },
    SelectBlacklist,
    InsertTicket(NewTicket),
    AssignTicket {
        id: Ulid,
        admin_id: Ulid,
    },
    ResolveTicket {
        id: Ulid,
        notes: Option<String>,
    },
    DeleteTicket {
        id: Ulid,
    },
    SelectTickets(TicketFilter),
    InsertAttachment(NewAttachment),
    DeleteAttachment {
        id: Ulid,
    },
    SelectAttachments {
        owner_id: Option<Ulid>,
    },
    SelectAttachmentData {
        id: Ulid,
    },
    SelectReport(ReportKind),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            if from.is_some() {
                return Err(SqlError::Unsupported("UPDATE ... FROM".into()));
            }
            parse_update(table, assignments, selection)
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table named by a SELECT, used to describe statements before their
/// parameters are bound. `None` for anything else.
pub fn query_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let mut f = insert_fields(insert)?;

    let cmd = match table.as_str() {
        "accounts" => Command::InsertAccount(NewAccount {
            id: f.ulid("id")?,
            email: f.text("email")?,
            first_name: f.text("first_name")?,
            last_name: f.text("last_name")?,
            role: f.parse("role", parse_role)?.unwrap_or(Role::Student),
            student_number: f.opt_text("student_number")?,
            phone: f.opt_text("phone")?,
        }),
        "rooms" => Command::InsertRoom(NewRoom {
            id: f.ulid("id")?,
            number: f.text("number")?,
            capacity: f.opt_u32("capacity")?,
            room_type: f.opt_text("room_type")?,
            building: f.opt_text("building")?,
            floor: f.opt_i32("floor")?,
        }),
        "residents" => Command::AssignResident {
            student_id: f.ulid("student_id")?,
            room_id: f.ulid("room_id")?,
        },
        "passes" => Command::InsertPass(PassRequest {
            id: f.ulid("id")?,
            requester_id: f.opt_ulid("requester_id")?,
            room_id: f.opt_ulid("room_id")?,
            guest: GuestDetails {
                name: f.text("guest_name")?,
                surname: f.text("guest_surname")?,
                id_number: f.text("guest_id_number")?,
                contact: f.opt_text("guest_contact")?,
            },
            start: f.date("start_date")?,
            end: f.date("end_date")?,
        }),
        "blacklist" => Command::InsertBlacklist {
            id_number: f.text("id_number")?,
            reason: f.opt_text("reason")?,
        },
        "tickets" => Command::InsertTicket(NewTicket {
            id: f.ulid("id")?,
            room_id: f.ulid("room_id")?,
            issue_type: f.text("issue_type")?,
            priority: f.parse("priority", parse_priority)?.unwrap_or(Priority::Medium),
            description: f.opt_text("description")?,
        }),
        "attachments" => {
            let encoded = f.text("data")?;
            let data = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| SqlError::BadValue("data", e.to_string()))?;
            Command::InsertAttachment(NewAttachment {
                id: f.ulid("id")?,
                owner_id: f.ulid("owner_id")?,
                file_name: f.text("file_name")?,
                content_type: f.opt_text("content_type")?,
                data,
            })
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let mut set = Fields::new("column");
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.insert(column, assignment.value.clone())?;
    }
    let mut filter = where_fields(selection)?;
    let id = filter.filter_ulid("id")?;
    filter.finish()?;

    let cmd = match table.as_str() {
        "accounts" if set.has("status") => Command::UpdateAccountStatus {
            id,
            status: set
                .parse("status", parse_account_status)?
                .ok_or(SqlError::MissingColumn("status"))?,
            reason: set.opt_text("reason")?,
        },
        "accounts" => {
            let changes = AccountChanges {
                first_name: set.opt_text("first_name")?,
                last_name: set.opt_text("last_name")?,
                phone: set.opt_text("phone")?,
                student_number: set.opt_text("student_number")?,
            };
            if changes.is_empty() && set.is_empty() {
                return Err(SqlError::MissingColumn("first_name"));
            }
            Command::UpdateAccount { id, changes }
        }
        "rooms" => Command::UpdateRoom {
            id,
            changes: RoomChanges {
                number: set.opt_text("number")?,
                capacity: set.opt_u32("capacity")?,
                room_type: set.opt_text("room_type")?,
                building: set.opt_text("building")?,
                floor: set.opt_i32("floor")?,
            },
        },
        "passes" if set.has("status") => Command::ResolvePass {
            id,
            status: set
                .parse("status", parse_pass_status)?
                .ok_or(SqlError::MissingColumn("status"))?,
            comments: set.opt_text("comments")?,
        },
        "passes" => {
            let changes = PassChanges {
                guest_name: set.opt_text("guest_name")?,
                guest_surname: set.opt_text("guest_surname")?,
                guest_id_number: set.opt_text("guest_id_number")?,
                guest_contact: set.opt_text("guest_contact")?,
                start: set.opt_date("start_date")?,
                end: set.opt_date("end_date")?,
            };
            if changes.is_empty() && set.is_empty() {
                return Err(SqlError::MissingColumn("start_date"));
            }
            Command::EditPass { id, changes }
        }
        "tickets" if set.has("assigned_to") => Command::AssignTicket {
            id,
            admin_id: set.ulid("assigned_to")?,
        },
        "tickets" => {
            let status = set
                .parse("status", parse_ticket_status)?
                .ok_or(SqlError::MissingColumn("status"))?;
            if status != TicketStatus::Resolved {
                return Err(SqlError::BadValue(
                    "status",
                    "tickets can only be set to RESOLVED".into(),
                ));
            }
            Command::ResolveTicket {
                id,
                notes: set.opt_text("notes")?,
            }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    set.finish()?;
    Ok(cmd)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut f = where_fields(&delete.selection)?;

    let cmd = match table.as_str() {
        "accounts" => Command::DeleteAccount { id: f.filter_ulid("id")? },
        "rooms" => Command::DeleteRoom { id: f.filter_ulid("id")? },
        "passes" => Command::DeletePass { id: f.filter_ulid("id")? },
        "tickets" => Command::DeleteTicket { id: f.filter_ulid("id")? },
        "attachments" => Command::DeleteAttachment { id: f.filter_ulid("id")? },
        "blacklist" => Command::DeleteBlacklist {
            id_number: f.opt_text("id_number")?.ok_or(SqlError::MissingFilter("id_number"))?,
        },
        "residents" => match (f.opt_ulid("student_id")?, f.opt_ulid("room_id")?) {
            (Some(student_id), room_id) => Command::RemoveResident { student_id, room_id },
            (None, Some(room_id)) => Command::ResetRoom { room_id },
            (None, None) => return Err(SqlError::MissingFilter("student_id")),
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut f = where_fields(&select.selection)?;

    let cmd = match table.as_str() {
        "accounts" => Command::SelectAccounts {
            role: f.parse("role", parse_role)?,
            status: f.parse("status", parse_account_status)?,
        },
        "rooms" => Command::SelectRooms(RoomFilter {
            available: f.opt_bool("available")?,
            building: f.opt_text("building")?,
            floor: f.opt_i32("floor")?,
            room_type: f.opt_text("room_type")?,
            maintained_before: f.opt_date("maintained_before")?,
        }),
        "passes" => Command::SelectPasses(PassFilter {
            id: f.opt_ulid("id")?,
            requester_id: f.opt_ulid("requester_id")?,
            status: f.parse("status", parse_pass_status)?,
        }),
        "blacklist" => Command::SelectBlacklist,
        "tickets" => Command::SelectTickets(TicketFilter {
            status: f.parse("status", parse_ticket_status)?,
            room_id: f.opt_ulid("room_id")?,
            student_id: f.opt_ulid("student_id")?,
        }),
        "attachments" => Command::SelectAttachments {
            owner_id: f.opt_ulid("owner_id")?,
        },
        "attachment_data" => Command::SelectAttachmentData { id: f.filter_ulid("id")? },
        "report_occupancy" => Command::SelectReport(ReportKind::Occupancy),
        "report_passes" => Command::SelectReport(ReportKind::Passes),
        "report_maintenance" => Command::SelectReport(ReportKind::Maintenance),
        "report_accounts" => Command::SelectReport(ReportKind::Accounts),
        "report_export" => Command::SelectReport(ReportKind::Export),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

// ── Column/value collection ───────────────────────────────────

/// Column → expression pairs gathered from a VALUES row, a SET list or an
/// AND-ed chain of `col = value` filters. Every pair must be consumed.
struct Fields {
    kind: &'static str,
    map: HashMap<String, Expr>,
}

impl Fields {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            map: HashMap::new(),
        }
    }

    fn insert(&mut self, column: String, expr: Expr) -> Result<(), SqlError> {
        if self.map.contains_key(&column) {
            return Err(SqlError::Parse(format!("{} {column} given twice", self.kind)));
        }
        self.map.insert(column, expr);
        Ok(())
    }

    fn has(&self, column: &str) -> bool {
        self.map.contains_key(column)
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn opt_text(&mut self, column: &str) -> Result<Option<String>, SqlError> {
        match self.map.remove(column) {
            Some(expr) => expr_text(&expr),
            None => Ok(None),
        }
    }

    fn text(&mut self, column: &'static str) -> Result<String, SqlError> {
        self.opt_text(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn parse<T>(
        &mut self,
        column: &'static str,
        parse: fn(&str) -> Option<T>,
    ) -> Result<Option<T>, SqlError> {
        match self.opt_text(column)? {
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| SqlError::BadValue(column, s)),
            None => Ok(None),
        }
    }

    fn opt_ulid(&mut self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.parse(column, |s| Ulid::from_string(s).ok())
    }

    fn ulid(&mut self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or(SqlError::MissingColumn(column))
    }

    /// Like `ulid`, but a missing value is reported as a missing filter.
    fn filter_ulid(&mut self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn opt_u32(&mut self, column: &'static str) -> Result<Option<u32>, SqlError> {
        self.parse(column, |s| s.parse().ok())
    }

    fn opt_i32(&mut self, column: &'static str) -> Result<Option<i32>, SqlError> {
        self.parse(column, |s| s.parse().ok())
    }

    fn opt_bool(&mut self, column: &'static str) -> Result<Option<bool>, SqlError> {
        self.parse(column, parse_bool)
    }

    fn opt_date(&mut self, column: &'static str) -> Result<Option<NaiveDate>, SqlError> {
        self.parse(column, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    fn date(&mut self, column: &'static str) -> Result<NaiveDate, SqlError> {
        self.opt_date(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn finish(self) -> Result<(), SqlError> {
        let mut leftover: Vec<String> = self.map.into_keys().collect();
        leftover.sort();
        match leftover.into_iter().next() {
            Some(column) => Err(SqlError::UnknownColumn(column)),
            None => Ok(()),
        }
    }
}

fn insert_fields(insert: &ast::Insert) -> Result<Fields, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs a column list".into()));
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
    }

    let mut fields = Fields::new("column");
    for (column, expr) in insert.columns.iter().zip(row) {
        fields.insert(column.value.to_lowercase(), expr.clone())?;
    }
    Ok(fields)
}

fn where_fields(selection: &Option<Expr>) -> Result<Fields, SqlError> {
    let mut fields = Fields::new("filter");
    if let Some(expr) = selection {
        collect_filters(expr, &mut fields)?;
    }
    Ok(fields)
}

fn collect_filters(expr: &Expr, fields: &mut Fields) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, fields)?;
                collect_filters(right, fields)
            }
            ast::BinaryOperator::Eq => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                fields.insert(column, right.as_ref().clone())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        Expr::Nested(inner) => collect_filters(inner, fields),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// A literal as text; `NULL` is `None`.
fn expr_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            _ => Err(SqlError::Parse(format!("unsupported literal {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(expr_text(expr)?.map(|s| format!("-{s}")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

fn parse_role(s: &str) -> Option<Role> {
    match s.to_uppercase().as_str() {
        "ADMIN" => Some(Role::Admin),
        "STUDENT" => Some(Role::Student),
        _ => None,
    }
}

fn parse_account_status(s: &str) -> Option<AccountStatus> {
    match s.to_uppercase().as_str() {
        "PENDING" => Some(AccountStatus::Pending),
        "ACTIVE" => Some(AccountStatus::Active),
        "DISABLED" => Some(AccountStatus::Disabled),
        _ => None,
    }
}

fn parse_pass_status(s: &str) -> Option<PassStatus> {
    match s.to_uppercase().as_str() {
        "PENDING" => Some(PassStatus::Pending),
        "APPROVED" => Some(PassStatus::Approved),
        "REJECTED" => Some(PassStatus::Rejected),
        _ => None,
    }
}

fn parse_ticket_status(s: &str) -> Option<TicketStatus> {
    match s.to_uppercase().as_str() {
        "PENDING" => Some(TicketStatus::Pending),
        "IN_PROGRESS" => Some(TicketStatus::InProgress),
        "RESOLVED" => Some(TicketStatus::Resolved),
        _ => None,
    }
}

fn parse_priority(s: &str) -> Option<Priority> {
    match s.to_uppercase().as_str() {
        "LOW" => Some(Priority::Low),
        "MEDIUM" => Some(Priority::Medium),
        "HIGH" => Some(Priority::High),
        "URGENT" => Some(Priority::Urgent),
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(col, v) => write!(f, "bad value for {col}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
