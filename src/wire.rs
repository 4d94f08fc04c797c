use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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

use crate::availability::AvailabilityEngine;
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::identity::{IdentityResolver, ResolverAuthSource};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingRow, Command, SqlError};

pub struct StayBnbHandler {
    engine: Arc<Engine>,
    availability: AvailabilityEngine,
    query_parser: Arc<StayBnbQueryParser>,
}

impl StayBnbHandler {
    pub fn new(engine: Arc<Engine>, availability: AvailabilityEngine) -> Self {
        Self {
            engine,
            availability,
            query_parser: Arc::new(StayBnbQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProperty {
                id,
                host_id,
                nightly_rate,
                max_guests,
                name,
            } => {
                engine
                    .list_property(id, host_id, name, nightly_rate, max_guests)
                    .await
                    .map_err(engine_err)?;
                self.update_listing_gauge();
                Ok(vec![insert_tag(1)])
            }
            Command::UpdateProperty {
                id,
                nightly_rate,
                max_guests,
                name,
            } => {
                engine
                    .update_property(id, name, nightly_rate, max_guests)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteProperty { id } => {
                engine.delist_property(id).await.map_err(engine_err)?;
                self.update_listing_gauge();
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking(row) => {
                let req = booking_request(&row)?;
                if let Some(existing) = self
                    .availability
                    .conflicting_booking(req.property_id, &req.stay)
                    .await
                    .map_err(engine_err)?
                {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "stage" => "precheck")
                        .increment(1);
                    return Err(engine_err(EngineError::Conflict(existing)));
                }
                engine.request_booking(req).await.map_err(guarded_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::BatchInsertBookings { bookings } => {
                let requests = bookings
                    .iter()
                    .map(booking_request)
                    .collect::<PgWireResult<Vec<_>>>()?;
                let created = engine
                    .batch_request_bookings(requests)
                    .await
                    .map_err(guarded_err)?;
                Ok(vec![insert_tag(created.len())])
            }
            Command::DeleteBooking { id } => {
                engine.purge_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ConfirmBooking { id } => {
                engine.confirm_booking(id).await.map_err(guarded_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::RejectBooking { id } => {
                engine.reject_booking(id).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::AmendBooking {
                id,
                check_in,
                check_out,
            } => {
                let stay = Stay::checked(check_in, check_out).map_err(engine_err)?;
                engine
                    .reschedule_booking(id, stay)
                    .await
                    .map_err(guarded_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::SelectProperties => {
                let mut properties = engine.list_properties().await;
                properties.sort_by_key(|p| p.id);
                Ok(vec![query_response(properties_schema(), properties, encode_property)])
            }
            Command::SelectProperty { id } => {
                let property = match engine.property_info(id).await {
                    Ok(p) => Some(p),
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(vec![query_response(properties_schema(), property, encode_property)])
            }
            Command::SelectBookings { property_id } => {
                let bookings = engine.get_bookings(property_id).await.map_err(engine_err)?;
                Ok(vec![query_response(bookings_schema(), bookings, encode_booking)])
            }
            Command::SelectBooking { id } => {
                let booking = match engine.get_booking(id).await {
                    Ok(b) => Some(b),
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(vec![query_response(bookings_schema(), booking, encode_booking)])
            }
            Command::SelectBlockedDates { property_id } => {
                let dates = self
                    .availability
                    .blocked_dates(property_id)
                    .await
                    .map_err(engine_err)?;
                let pid = property_id.to_string();
                Ok(vec![query_response(blocked_dates_schema(), dates, |enc, d| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&d.to_string())
                })])
            }
            Command::SelectDisabledDates { property_id } => {
                let json = self
                    .availability
                    .blocked_dates_json(property_id)
                    .await
                    .map_err(engine_err)?;
                let row = (property_id.to_string(), json);
                Ok(vec![query_response(disabled_dates_schema(), [row], |enc, (pid, json)| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&json)
                })])
            }
            Command::SelectOverlap {
                property_id,
                check_in,
                check_out,
            } => {
                let overlap = self
                    .availability
                    .has_overlap_dates(property_id, check_in, check_out)
                    .await
                    .map_err(engine_err)?;
                let pid = property_id.to_string();
                Ok(vec![query_response(overlaps_schema(), [overlap], |enc, o| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&o)
                })])
            }
            Command::SelectAvailability {
                property_id,
                check_in,
                check_out,
            } => {
                let window = Stay::checked(check_in, check_out).map_err(engine_err)?;
                let free = self
                    .availability
                    .free_windows(property_id, &window)
                    .await
                    .map_err(engine_err)?;
                let pid = property_id.to_string();
                Ok(vec![query_response(availability_schema(), free, |enc, s| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&s.check_in.to_string())?;
                    enc.encode_field(&s.check_out.to_string())?;
                    enc.encode_field(&s.nights())
                })])
            }
        }
    }

    fn update_listing_gauge(&self) {
        metrics::gauge!(observability::PROPERTIES_LISTED).set(self.engine.state.len() as f64);
    }
}

fn booking_request(row: &BookingRow) -> PgWireResult<BookingRequest> {
    Ok(BookingRequest {
        id: row.id,
        property_id: row.property_id,
        guest_id: row.guest_id,
        stay: Stay::checked(row.check_in, row.check_out).map_err(engine_err)?,
        guests: row.guests,
    })
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn encode_property(enc: &mut DataRowEncoder, p: PropertyInfo) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.host_id.to_string())?;
    enc.encode_field(&p.name)?;
    enc.encode_field(&p.nightly_rate)?;
    enc.encode_field(&i64::from(p.max_guests))
}

fn encode_booking(enc: &mut DataRowEncoder, b: BookingInfo) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.property_id.to_string())?;
    enc.encode_field(&b.guest_id.to_string())?;
    enc.encode_field(&b.check_in.to_string())?;
    enc.encode_field(&b.check_out.to_string())?;
    enc.encode_field(&i64::from(b.guests))?;
    enc.encode_field(&b.total_price)?;
    enc.encode_field(&b.status.as_str())
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn properties_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("host_id", Type::VARCHAR),
        column("name", Type::VARCHAR),
        column("nightly_rate", Type::INT8),
        column("max_guests", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("property_id", Type::VARCHAR),
        column("guest_id", Type::VARCHAR),
        column("check_in", Type::VARCHAR),
        column("check_out", Type::VARCHAR),
        column("guests", Type::INT8),
        column("total_price", Type::INT8),
        column("status", Type::VARCHAR),
    ]
}

fn blocked_dates_schema() -> Vec<FieldInfo> {
    vec![column("property_id", Type::VARCHAR), column("date", Type::VARCHAR)]
}

fn disabled_dates_schema() -> Vec<FieldInfo> {
    vec![column("property_id", Type::VARCHAR), column("dates", Type::VARCHAR)]
}

fn overlaps_schema() -> Vec<FieldInfo> {
    vec![column("property_id", Type::VARCHAR), column("has_overlap", Type::BOOL)]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        column("property_id", Type::VARCHAR),
        column("check_in", Type::VARCHAR),
        column("check_out", Type::VARCHAR),
        column("nights", Type::INT8),
    ]
}

/// Row shape of a statement, by the table it selects from. Empty for writes.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_whitespace()
        .skip_while(|word| *word != "from")
        .nth(1)
        .and_then(|word| {
            word.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .next()
        })
        .unwrap_or("");
    match table {
        "properties" => properties_schema(),
        "bookings" => bookings_schema(),
        "blocked_dates" => blocked_dates_schema(),
        "disabled_dates" => disabled_dates_schema(),
        "overlaps" => overlaps_schema(),
        "availability" => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StayBnbHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StayBnbQueryParser;

#[async_trait]
impl QueryParser for StayBnbQueryParser {
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
impl ExtendedQueryHandler for StayBnbHandler {
    type Statement = String;
    type QueryParser = StayBnbQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StayBnbFactory {
    handler: Arc<StayBnbHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ResolverAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StayBnbFactory {
    pub fn new(
        engine: Arc<Engine>,
        availability: AvailabilityEngine,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            handler: Arc::new(StayBnbHandler::new(engine, availability)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ResolverAuthSource::new(identity),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StayBnbFactory {
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
    engine: Arc<Engine>,
    identity: Arc<dyn IdentityResolver>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let availability = AvailabilityEngine::new(engine.clone(), *engine.policy());
    let factory = Arc::new(StayBnbFactory::new(engine, availability, identity));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidInterval { .. } => "22007",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::TooManyGuests { .. } => "23514",
        EngineError::HasActiveBookings(_) => "23503",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::RetrievalFailed(_) => "58000",
        EngineError::WalError(_) => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

/// `engine_err` for writes that went through the ledger's guarded check.
fn guarded_err(e: EngineError) -> PgWireError {
    if e.is_conflict() {
        metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "stage" => "guarded").increment(1);
    }
    engine_err(e)
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
