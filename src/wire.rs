use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::HallAuthSource;
use crate::engine::{Actor, Engine, EngineError};
use crate::halls::HallManager;
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ReportKind};

pub struct HallHandler {
    halls: Arc<HallManager>,
    superuser: String,
    query_parser: Arc<HallQueryParser>,
}

impl HallHandler {
    pub fn new(halls: Arc<HallManager>, superuser: String) -> Self {
        Self {
            halls,
            superuser,
            query_parser: Arc::new(HallQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.halls.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("hall error: {e}"),
            )))
        })
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C, engine: &Engine) -> Actor {
        match client.metadata().get("user") {
            Some(login) => engine.resolve_actor(login, &self.superuser),
            None => Actor::anonymous(),
        }
    }

    async fn run_sql<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client, &engine);
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "parse", "status" => "error").increment(1);
            sql_err(e)
        })?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let login = client.metadata().get("user").map(String::as_str);
        let result = self.execute_command(&engine, &actor, login, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        login: Option<&str>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let response = match cmd {
            // ── Accounts ─────────────────────────────────────
            Command::InsertAccount(new) if actor.is_admin() => {
                engine.create_account(actor, new).await.map_err(engine_err)?;
                inserted(1)
            }
            // Anyone else is signing themselves up.
            Command::InsertAccount(new) => {
                let login = login.ok_or_else(|| {
                    engine_err(EngineError::Forbidden("sign up needs a login name"))
                })?;
                engine.sign_up(login, new).await.map_err(engine_err)?;
                inserted(1)
            }
            Command::UpdateAccount { id, changes } => {
                engine
                    .update_account(actor, id, changes)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::UpdateAccountStatus { id, status, reason } => {
                engine
                    .set_account_status(actor, id, status, reason)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::DeleteAccount { id } => {
                engine.delete_account(actor, id).await.map_err(engine_err)?;
                deleted(1)
            }
            Command::SelectAccounts { role, status } => {
                let accounts = engine
                    .list_accounts(actor, role, status)
                    .map_err(engine_err)?;
                query_response(account_schema(), &accounts, encode_account)
            }

            // ── Rooms and residents ──────────────────────────
            Command::InsertRoom(new) => {
                engine.create_room(actor, new).await.map_err(engine_err)?;
                inserted(1)
            }
            Command::UpdateRoom { id, changes } => {
                engine
                    .update_room(actor, id, changes)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(actor, id).await.map_err(engine_err)?;
                deleted(1)
            }
            Command::SelectRooms(filter) => {
                let rooms = engine.list_rooms(actor, &filter).await.map_err(engine_err)?;
                query_response(room_schema(), &rooms, encode_room)
            }
            Command::AssignResident { student_id, room_id } => {
                engine
                    .assign_resident(actor, student_id, room_id)
                    .await
                    .map_err(engine_err)?;
                inserted(1)
            }
            Command::RemoveResident { student_id, room_id } => {
                engine
                    .remove_resident(actor, student_id, room_id)
                    .await
                    .map_err(engine_err)?;
                deleted(1)
            }
            Command::ResetRoom { room_id } => {
                let removed = engine.reset_room(actor, room_id).await.map_err(engine_err)?;
                deleted(removed.len())
            }

            // ── Guest passes ─────────────────────────────────
            Command::InsertPass(req) => {
                engine.request_pass(actor, req).await.map_err(engine_err)?;
                inserted(1)
            }
            Command::EditPass { id, changes } => {
                engine
                    .edit_pass(actor, id, changes)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::ResolvePass { id, status, comments } => {
                engine
                    .resolve_pass(actor, id, status, comments)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::DeletePass { id } => {
                engine.delete_pass(actor, id).await.map_err(engine_err)?;
                deleted(1)
            }
            Command::SelectPasses(filter) => {
                let passes = engine.list_passes(actor, &filter).await.map_err(engine_err)?;
                query_response(pass_schema(), &passes, encode_pass)
            }
            Command::InsertBlacklist { id_number, reason } => {
                engine
                    .add_to_blacklist(actor, id_number, reason)
                    .await
                    .map_err(engine_err)?;
                inserted(1)
            }
            Command::DeleteBlacklist { id_number } => {
                engine
                    .remove_from_blacklist(actor, id_number)
                    .await
                    .map_err(engine_err)?;
                deleted(1)
            }
            Command::SelectBlacklist => {
                let entries = engine.list_blacklist(actor).map_err(engine_err)?;
                query_response(blacklist_schema(), &entries, |enc, e| {
                    enc.encode_field(&e.id_number)?;
                    enc.encode_field(&e.reason)
                })
            }

            // ── Maintenance ──────────────────────────────────
            Command::InsertTicket(new) => {
                engine.open_ticket(actor, new).await.map_err(engine_err)?;
                inserted(1)
            }
            Command::AssignTicket { id, admin_id } => {
                engine
                    .assign_ticket(actor, id, admin_id)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::ResolveTicket { id, notes } => {
                engine
                    .resolve_ticket(actor, id, notes)
                    .await
                    .map_err(engine_err)?;
                updated(1)
            }
            Command::DeleteTicket { id } => {
                engine.delete_ticket(actor, id).await.map_err(engine_err)?;
                deleted(1)
            }
            Command::SelectTickets(filter) => {
                let tickets = engine.list_tickets(actor, &filter).map_err(engine_err)?;
                query_response(ticket_schema(), &tickets, encode_ticket)
            }

            // ── Files ────────────────────────────────────────
            Command::InsertAttachment(new) => {
                engine
                    .store_attachment(actor, new)
                    .await
                    .map_err(engine_err)?;
                inserted(1)
            }
            Command::DeleteAttachment { id } => {
                engine.delete_attachment(actor, id).await.map_err(engine_err)?;
                deleted(1)
            }
            Command::SelectAttachments { owner_id } => {
                let attachments = engine
                    .list_attachments(actor, owner_id)
                    .map_err(engine_err)?;
                query_response(attachment_schema(), &attachments, encode_attachment)
            }
            Command::SelectAttachmentData { id } => {
                let (meta, data) = engine.read_attachment(actor, id).await.map_err(engine_err)?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                query_response(attachment_data_schema(), &[(meta, encoded)], |enc, (m, d)| {
                    enc.encode_field(&m.id.to_string())?;
                    enc.encode_field(&m.file_name)?;
                    enc.encode_field(&m.content_type)?;
                    enc.encode_field(d)
                })
            }

            // ── Reports ──────────────────────────────────────
            Command::SelectReport(kind) => self.report(engine, actor, kind).await?,
        };
        Ok(vec![response])
    }

    async fn report(&self, engine: &Engine, actor: &Actor, kind: ReportKind) -> PgWireResult<Response> {
        let rows = match kind {
            ReportKind::Occupancy => {
                let r = engine.occupancy_report(actor).await.map_err(engine_err)?;
                vec![
                    ("rooms", r.rooms),
                    ("total_capacity", r.total_capacity),
                    ("total_occupancy", r.total_occupancy),
                    ("full_rooms", r.full_rooms),
                    ("available_rooms", r.available_rooms),
                ]
            }
            ReportKind::Passes => {
                let r = engine.pass_report(actor).await.map_err(engine_err)?;
                vec![
                    ("total", r.total),
                    ("pending", r.pending),
                    ("approved", r.approved),
                    ("rejected", r.rejected),
                ]
            }
            ReportKind::Maintenance => {
                let r = engine.maintenance_report(actor).map_err(engine_err)?;
                vec![
                    ("total", r.total),
                    ("pending", r.pending),
                    ("in_progress", r.in_progress),
                    ("resolved", r.resolved),
                ]
            }
            ReportKind::Accounts => {
                let r = engine.account_report(actor).map_err(engine_err)?;
                vec![
                    ("total", r.total),
                    ("students", r.students),
                    ("admins", r.admins),
                    ("pending", r.pending),
                    ("active", r.active),
                    ("disabled", r.disabled),
                ]
            }
            ReportKind::Export => {
                let report = engine.hall_report(actor).await.map_err(engine_err)?;
                let json = serde_json::to_string(&report)
                    .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                return Ok(query_response(export_schema(), &[json], |enc, j| {
                    enc.encode_field(j)
                }));
            }
        };
        Ok(query_response(report_schema(), &rows, |enc, (name, value)| {
            enc.encode_field(&name.to_string())?;
            enc.encode_field(&(*value as i64))
        }))
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated(rows: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Row encoding ─────────────────────────────────────────────────

fn text<T: ToString>(value: &Option<T>) -> Option<String> {
    value.as_ref().map(ToString::to_string)
}

fn upper<T: Debug>(value: T) -> String {
    let name = format!("{value:?}");
    // InProgress -> IN_PROGRESS
    let mut out = String::with_capacity(name.len() + 2);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

fn encode_account(enc: &mut DataRowEncoder, a: &Account) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.email)?;
    enc.encode_field(&a.first_name)?;
    enc.encode_field(&a.last_name)?;
    enc.encode_field(&a.phone)?;
    enc.encode_field(&upper(a.role))?;
    enc.encode_field(&upper(a.status))?;
    enc.encode_field(&a.student_number)?;
    enc.encode_field(&text(&a.room_id))?;
    enc.encode_field(&text(&a.status_changed_by))?;
    enc.encode_field(&a.status_reason)?;
    enc.encode_field(&a.created_at)
}

fn encode_room(enc: &mut DataRowEncoder, r: &Room) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.number)?;
    enc.encode_field(&r.room_type)?;
    enc.encode_field(&r.building)?;
    enc.encode_field(&r.floor.map(i64::from))?;
    enc.encode_field(&i64::from(r.capacity))?;
    enc.encode_field(&i64::from(r.occupancy()))?;
    enc.encode_field(&text(&r.last_maintenance))?;
    enc.encode_field(&crate::engine::occupancy::is_available(r))
}

fn encode_pass(enc: &mut DataRowEncoder, p: &GuestPass) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.requester_id.to_string())?;
    enc.encode_field(&text(&p.room_id))?;
    enc.encode_field(&p.guest.name)?;
    enc.encode_field(&p.guest.surname)?;
    enc.encode_field(&p.guest.id_number)?;
    enc.encode_field(&p.guest.contact)?;
    enc.encode_field(&p.dates.start.to_string())?;
    enc.encode_field(&p.dates.end.to_string())?;
    enc.encode_field(&upper(p.status))?;
    enc.encode_field(&text(&p.resolved_by))?;
    enc.encode_field(&p.resolved_at)?;
    enc.encode_field(&p.comments)?;
    enc.encode_field(&p.created_at)?;
    enc.encode_field(&p.updated_at)
}

fn encode_ticket(enc: &mut DataRowEncoder, t: &MaintenanceTicket) -> PgWireResult<()> {
    enc.encode_field(&t.id.to_string())?;
    enc.encode_field(&text(&t.student_id))?;
    enc.encode_field(&t.room_id.to_string())?;
    enc.encode_field(&t.issue_type)?;
    enc.encode_field(&t.description)?;
    enc.encode_field(&upper(t.priority))?;
    enc.encode_field(&upper(t.status))?;
    enc.encode_field(&text(&t.assigned_to))?;
    enc.encode_field(&t.notes)?;
    enc.encode_field(&t.reported_at)?;
    enc.encode_field(&t.resolved_at)
}

fn encode_attachment(enc: &mut DataRowEncoder, a: &Attachment) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.owner_id.to_string())?;
    enc.encode_field(&text(&a.uploader_id))?;
    enc.encode_field(&a.file_name)?;
    enc.encode_field(&a.content_type)?;
    enc.encode_field(&(a.size as i64))?;
    enc.encode_field(&i64::from(a.crc32))?;
    enc.encode_field(&a.created_at)
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn varchars(names: &[&str]) -> Vec<FieldInfo> {
    names.iter().map(|n| field(n, Type::VARCHAR)).collect()
}

fn account_schema() -> Vec<FieldInfo> {
    let mut schema = varchars(&[
        "id",
        "email",
        "first_name",
        "last_name",
        "phone",
        "role",
        "status",
        "student_number",
        "room_id",
        "status_changed_by",
        "status_reason",
    ]);
    schema.push(field("created_at", Type::INT8));
    schema
}

fn room_schema() -> Vec<FieldInfo> {
    let mut schema = varchars(&["id", "number", "room_type", "building"]);
    schema.push(field("floor", Type::INT8));
    schema.push(field("capacity", Type::INT8));
    schema.push(field("occupancy", Type::INT8));
    schema.push(field("last_maintenance", Type::VARCHAR));
    schema.push(field("available", Type::BOOL));
    schema
}

fn pass_schema() -> Vec<FieldInfo> {
    let mut schema = varchars(&[
        "id",
        "requester_id",
        "room_id",
        "guest_name",
        "guest_surname",
        "guest_id_number",
        "guest_contact",
        "start_date",
        "end_date",
        "status",
        "resolved_by",
    ]);
    schema.push(field("resolved_at", Type::INT8));
    schema.push(field("comments", Type::VARCHAR));
    schema.push(field("created_at", Type::INT8));
    schema.push(field("updated_at", Type::INT8));
    schema
}

fn blacklist_schema() -> Vec<FieldInfo> {
    varchars(&["id_number", "reason"])
}

fn ticket_schema() -> Vec<FieldInfo> {
    let mut schema = varchars(&[
        "id",
        "student_id",
        "room_id",
        "issue_type",
        "description",
        "priority",
        "status",
        "assigned_to",
        "notes",
    ]);
    schema.push(field("reported_at", Type::INT8));
    schema.push(field("resolved_at", Type::INT8));
    schema
}

fn attachment_schema() -> Vec<FieldInfo> {
    let mut schema = varchars(&["id", "owner_id", "uploader_id", "file_name", "content_type"]);
    schema.push(field("size", Type::INT8));
    schema.push(field("crc32", Type::INT8));
    schema.push(field("created_at", Type::INT8));
    schema
}

fn attachment_data_schema() -> Vec<FieldInfo> {
    varchars(&["id", "file_name", "content_type", "data"])
}

fn report_schema() -> Vec<FieldInfo> {
    vec![field("metric", Type::VARCHAR), field("value", Type::INT8)]
}

fn export_schema() -> Vec<FieldInfo> {
    vec![field("report", Type::VARCHAR)]
}

/// Result columns of a statement, known from its table alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::query_table(sql).as_deref() {
        Some("accounts") => account_schema(),
        Some("rooms") => room_schema(),
        Some("passes") => pass_schema(),
        Some("blacklist") => blacklist_schema(),
        Some("tickets") => ticket_schema(),
        Some("attachments") => attachment_schema(),
        Some("attachment_data") => attachment_data_schema(),
        Some("report_occupancy" | "report_passes" | "report_maintenance" | "report_accounts") => {
            report_schema()
        }
        Some("report_export") => export_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for HallHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_sql(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HallQueryParser;

#[async_trait]
impl QueryParser for HallQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HallHandler {
    type Statement = String;
    type QueryParser = HallQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run_sql(client, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Byte ranges and indexes of every `$N` placeholder outside quoted text.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote is an escape; either way the scan stays inside.
            Some(q) if b == q => {
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start
                    && let Ok(n) = sql[start..end].parse::<usize>()
                {
                    found.push((i, end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql)
        .into_iter()
        .map(|(_, _, n)| n)
        .max()
        .unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass, so a bound value is never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HallFactory {
    handler: Arc<HallHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<HallAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HallFactory {
    pub fn new(halls: Arc<HallManager>, password: String, superuser: String) -> Self {
        let auth_source = HallAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(HallHandler::new(halls, superuser)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HallFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    halls: Arc<HallManager>,
    password: String,
    superuser: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(HallFactory::new(halls, password, superuser));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match e {
        EngineError::Forbidden(_) => "42501",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
