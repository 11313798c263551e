//! Command dispatcher
//!
//! Per-connection state machine: handshake, then strictly serialized
//! commands. COM_QUERY is the hot path: parse, classify, plan, execute,
//! stream the result set back with strictly increasing sequence ids.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::Permission;
use crate::error::{Error, Result};
use crate::exec::{self, ExecContext};
use crate::plan::logical::{LogicalPlanner, Schema};
use crate::plan::physical::PhysicalPlan;
use crate::plan::rewrite;
use crate::protocol::constants::{column_type, Command};
use crate::protocol::handshake::{
    build_handshake, generate_scramble, parse_handshake_response, verify_auth,
};
use crate::protocol::packet::{read_packet, write_packet, PayloadReader};
use crate::protocol::response::{
    build_column_count, build_column_definition, build_binary_row, build_eof, build_err,
    build_ok, build_stmt_prepare_ok, build_text_row,
};
use crate::rowset;
use crate::server::GatewayContext;
use crate::session::Session;
use crate::sql::ast::{
    CreateTableStmt, DeleteStmt, Expr, InsertStmt, SelectItem, SelectStmt, ShowKind, Statement,
    UpdateStmt,
};
use crate::sql::parse;
use crate::storage::engine::{Isolation, ScanRequest, StorageEngine, TxnContext};
use crate::storage::schema::{ColumnDescriptor, SemanticType, TableDescriptor};
use crate::storage::value::{Row, Value};

/// Result of executing a non-streaming statement.
enum Outcome {
    Ok {
        affected: u64,
        last_insert_id: u64,
        info: Option<String>,
    },
    ResultSet {
        table: String,
        schema: Schema,
        rows: Vec<Row>,
    },
}

/// Per-connection handler; generic over the stream so tests can drive it
/// through an in-memory duplex.
pub struct ConnectionHandler<S> {
    stream: S,
    ctx: Arc<GatewayContext>,
    session: Arc<tokio::sync::Mutex<Session>>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        ctx: Arc<GatewayContext>,
        session: Arc<tokio::sync::Mutex<Session>>,
    ) -> Self {
        Self {
            stream,
            ctx,
            session,
        }
    }

    /// Drive the connection: handshake, then the command loop. Any I/O error
    /// tears the session down.
    pub async fn run(mut self) -> Result<()> {
        let session_handle = Arc::clone(&self.session);
        let thread_id = session_handle.lock().await.thread_id;

        let authenticated = {
            let mut session = session_handle.lock().await;
            self.handshake(&mut session).await
        };
        match authenticated {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(thread_id, %e, "Handshake failed");
                self.ctx.sessions.remove(thread_id);
                return Ok(());
            }
        }

        loop {
            if !self.ctx.sessions.is_live(thread_id) {
                tracing::debug!(thread_id, "Session reaped, closing connection");
                break;
            }
            let idle = self.ctx.config.server.idle_timeout;
            let packet = match tokio::time::timeout(idle, read_packet(&mut self.stream)).await {
                Err(_) => {
                    tracing::debug!(thread_id, "Idle timeout, closing connection");
                    break;
                }
                Ok(Err(e)) => {
                    // Oversized or malformed frames get a protocol-violation
                    // ERR before the connection drops; plain I/O errors do not.
                    if !matches!(e, Error::Io(_)) {
                        let mut session = session_handle.lock().await;
                        session.begin_command(0);
                        let _ = self.send_err(&mut session, &e).await;
                    }
                    tracing::debug!(thread_id, %e, "Connection closed");
                    break;
                }
                Ok(Ok(p)) => p,
            };

            let mut session = session_handle.lock().await;
            session.begin_command(packet.header.sequence_id);
            let Some(command_byte) = packet.command_byte() else {
                continue;
            };

            let command = Command::from(command_byte);
            let result = match command {
                Command::Quit => break,
                Command::Ping => self.send_ok(&mut session, 0, 0, None).await,
                Command::InitDb => {
                    let db = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                    match self.switch_database(&mut session, &db) {
                        Ok(()) => self.send_ok(&mut session, 0, 0, None).await,
                        Err(e) => Err(e),
                    }
                }
                Command::Query => match std::str::from_utf8(&packet.payload[1..]) {
                    Ok(sql) => {
                        let sql = sql.to_string();
                        self.handle_query(&mut session, &sql).await
                    }
                    Err(_) => Err(Error::Protocol("query text is not valid UTF-8".into())),
                },
                Command::FieldList => self.handle_field_list(&mut session, &packet.payload).await,
                Command::StmtPrepare => {
                    let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                    self.handle_stmt_prepare(&mut session, &sql).await
                }
                Command::StmtExecute => {
                    self.handle_stmt_execute(&mut session, &packet.payload).await
                }
                Command::StmtClose => {
                    // No response packet for COM_STMT_CLOSE.
                    if packet.payload.len() >= 5 {
                        let mut reader = PayloadReader::new(&packet.payload[1..]);
                        if let Ok(id) = reader.read_u32_le() {
                            session.close_prepared(id);
                        }
                    }
                    Ok(())
                }
                Command::Unknown(byte) => {
                    let e = Error::Unsupported(format!("command 0x{byte:02x}"));
                    self.send_err(&mut session, &e).await
                }
            };

            if let Err(e) = result {
                let fatal = e.is_fatal();
                if !matches!(e, Error::Io(_)) {
                    let _ = self.send_err(&mut session, &e).await;
                }
                if fatal {
                    tracing::debug!(thread_id, %e, "Fatal error, closing session");
                    break;
                }
            }
        }

        // Roll back any transaction still open when the connection dies.
        {
            let mut session = session_handle.lock().await;
            if let Some(txn) = session.txn.take() {
                self.ctx.router.memory.rollback(&txn);
            }
        }
        self.ctx.sessions.remove(thread_id);
        Ok(())
    }

    // --- handshake ---

    async fn handshake(&mut self, session: &mut Session) -> Result<()> {
        let scramble = generate_scramble();
        let payload =
            build_handshake(&self.ctx.config.server.version, session.thread_id, &scramble);
        write_packet(&mut self.stream, 0, &payload).await?;

        let packet = read_packet(&mut self.stream).await?;
        session.begin_command(packet.header.sequence_id);
        let response = parse_handshake_response(&packet.payload)?;

        let password = self
            .ctx
            .auth
            .password_for(&response.username)
            .ok_or_else(|| Error::AuthFailed(response.username.clone()));
        let verified = match password {
            Ok(password) => verify_auth(password, &scramble, &response.auth_response),
            Err(_) => false,
        };
        if !verified {
            let e = Error::AuthFailed(response.username.clone());
            self.send_err(session, &e).await?;
            return Err(e);
        }

        session.username = response.username;
        if let Some(db) = response.database {
            if let Err(e) = self.switch_database(session, &db) {
                self.send_err(session, &e).await?;
                return Err(e);
            }
        }
        self.send_ok(session, 0, 0, None).await?;
        tracing::info!(
            thread_id = session.thread_id,
            user = %session.username,
            "Client authenticated"
        );
        Ok(())
    }

    fn switch_database(&self, session: &mut Session, db: &str) -> Result<()> {
        if !self.ctx.catalog.has_database(db) {
            return Err(Error::UnknownDatabase(db.to_string()));
        }
        session.database = db.to_string();
        Ok(())
    }

    // --- wire helpers ---

    async fn send_payload(&mut self, session: &mut Session, payload: &[u8]) -> Result<()> {
        let seq = session.next_seq();
        write_packet(&mut self.stream, seq, payload).await
    }

    async fn send_ok(
        &mut self,
        session: &mut Session,
        affected: u64,
        last_insert_id: u64,
        info: Option<&str>,
    ) -> Result<()> {
        let payload = build_ok(affected, last_insert_id, session.status_flags(), 0, info);
        self.send_payload(session, &payload).await?;
        crate::protocol::packet::flush(&mut self.stream).await
    }

    async fn send_err(&mut self, session: &mut Session, err: &Error) -> Result<()> {
        let payload = build_err(err);
        self.send_payload(session, &payload).await?;
        crate::protocol::packet::flush(&mut self.stream).await
    }

    async fn write_result_header(
        &mut self,
        session: &mut Session,
        table: &str,
        schema: &Schema,
    ) -> Result<()> {
        self.send_payload(session, &build_column_count(schema.len()))
            .await?;
        let database = session.database.clone();
        for column in schema {
            let payload = build_column_definition(&database, table, column);
            self.send_payload(session, &payload).await?;
        }
        let eof = build_eof(0, session.status_flags());
        self.send_payload(session, &eof).await
    }

    async fn write_result_set(
        &mut self,
        session: &mut Session,
        table: &str,
        schema: &Schema,
        rows: &[Row],
        binary: bool,
    ) -> Result<()> {
        self.write_result_header(session, table, schema).await?;
        for row in rows {
            let payload = if binary {
                build_binary_row(row, schema)
            } else {
                build_text_row(row)
            };
            self.send_payload(session, &payload).await?;
        }
        let eof = build_eof(0, session.status_flags());
        self.send_payload(session, &eof).await?;
        crate::protocol::packet::flush(&mut self.stream).await
    }

    // --- query path ---

    async fn handle_query(&mut self, session: &mut Session, sql: &str) -> Result<()> {
        let statement = parse::parse(sql)?;
        tracing::debug!(
            thread_id = session.thread_id,
            class = ?statement.class(),
            "Dispatching query"
        );
        self.ctx
            .metrics
            .queries_executed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.execute(session, statement, Some(sql), false).await
    }

    /// Execute a parsed statement; `sql` enables the result cache, `binary`
    /// selects the row protocol (COM_STMT_EXECUTE responses).
    async fn execute(
        &mut self,
        session: &mut Session,
        statement: Statement,
        sql: Option<&str>,
        binary: bool,
    ) -> Result<()> {
        match statement {
            Statement::Select(select) => self.run_select(session, &select, sql, binary).await,
            Statement::Explain(select) => {
                let plan = self.plan_select(session, &select)?;
                let schema = vec![ColumnDescriptor::new("plan", SemanticType::String)];
                let rows: Vec<Row> = plan
                    .explain()
                    .into_iter()
                    .map(|line| Row::from_pairs(vec![("plan".into(), Value::Str(line))]))
                    .collect();
                self.write_result_set(session, "", &schema, &rows, binary)
                    .await
            }
            other => {
                let outcome = self.execute_statement(session, other).await?;
                match outcome {
                    Outcome::Ok {
                        affected,
                        last_insert_id,
                        info,
                    } => {
                        self.send_ok(session, affected, last_insert_id, info.as_deref())
                            .await
                    }
                    Outcome::ResultSet {
                        table,
                        schema,
                        rows,
                    } => {
                        self.write_result_set(session, &table, &schema, &rows, binary)
                            .await
                    }
                }
            }
        }
    }

    fn planner(&self, session: &Session) -> LogicalPlanner {
        LogicalPlanner::new(
            Arc::clone(&self.ctx.catalog),
            Arc::clone(&self.ctx.optimizer.stats),
            session.database.clone(),
        )
    }

    fn plan_select(&self, session: &Session, select: &SelectStmt) -> Result<PhysicalPlan> {
        let planner = self.planner(session);
        let logical = planner.plan(select)?;
        let logical = rewrite::rewrite(logical, &planner)?;
        self.ctx
            .metrics
            .plans_optimized
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.ctx.optimizer.optimize(logical, &session.database)
    }

    fn exec_context(&self, session: &Session, txn: TxnContext) -> ExecContext {
        let ceiling = self.ctx.config.pool.worker_pool.max_workers;
        ExecContext {
            txn,
            database: session.database.clone(),
            router: Arc::clone(&self.ctx.router),
            fts: Arc::clone(&self.ctx.fts),
            catalog: Arc::clone(&self.ctx.catalog),
            metrics: Arc::clone(&self.ctx.metrics),
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + self.ctx.config.database.query_deadline),
            parallelism: session.parallelism.min(ceiling).max(1),
        }
    }

    fn statement_txn(&self, session: &Session) -> Result<(TxnContext, bool)> {
        match session.txn {
            Some(txn) => Ok((txn, false)),
            None => Ok((self.ctx.router.memory.begin(Isolation::Snapshot)?, true)),
        }
    }

    fn finish_statement_txn<T>(
        &self,
        one_shot: bool,
        txn: &TxnContext,
        result: Result<T>,
    ) -> Result<T> {
        if !one_shot {
            return result;
        }
        match result {
            Ok(v) => {
                self.ctx.router.memory.commit(txn)?;
                Ok(v)
            }
            Err(e) => {
                self.ctx.router.memory.rollback(txn);
                Err(e)
            }
        }
    }

    async fn run_select(
        &mut self,
        session: &mut Session,
        select: &SelectStmt,
        sql: Option<&str>,
        binary: bool,
    ) -> Result<()> {
        // ACL: every source table needs READ.
        if let Some(from) = &select.from {
            let mut tables = vec![from.base.name.clone()];
            tables.extend(from.joins.iter().map(|j| j.relation.name.clone()));
            for t in &tables {
                self.ctx
                    .acl
                    .check(&session.username, Permission::READ, t)?;
            }
        }

        // Result cache applies to autocommit text-protocol reads only.
        let cache_key = match (sql, session.txn.is_none(), binary) {
            (Some(sql), true, false) => Some(crate::cache::QueryCache::key(&session.database, sql)),
            _ => None,
        };
        if let Some(key) = &cache_key {
            if let Some(hit) = self.ctx.cache.get(key) {
                let table = hit.tables.first().cloned().unwrap_or_default();
                return self
                    .write_result_set(session, &table, &hit.schema, &hit.rows, binary)
                    .await;
            }
        }

        let plan = self.plan_select(session, select)?;
        let schema = plan.schema().clone();
        let mut source_tables = Vec::new();
        plan.scan_order(&mut source_tables);
        let table_label = source_tables.first().cloned().unwrap_or_default();

        let (txn, one_shot) = self.statement_txn(session)?;
        let ctx = self.exec_context(session, txn);

        let mut op = exec::build(&plan);
        if let Err(e) = op.open(&ctx).await {
            // Nothing framed yet; the caller reports the error.
            op.close().await;
            if one_shot {
                self.ctx.router.memory.rollback(&txn);
            }
            return Err(e);
        }

        self.write_result_header(session, &table_label, &schema)
            .await?;
        let mut rows = Vec::new();
        let mut failure: Option<Error> = None;
        loop {
            match op.next(&ctx).await {
                Ok(Some(row)) => {
                    let payload = if binary {
                        build_binary_row(&row, &schema)
                    } else {
                        build_text_row(&row)
                    };
                    self.send_payload(session, &payload).await?;
                    rows.push(row);
                }
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        op.close().await;

        if let Some(e) = failure {
            // Rows already framed are not recalled; terminate the set with
            // an ERR packet at the current sequence id.
            if one_shot {
                self.ctx.router.memory.rollback(&txn);
            }
            tracing::debug!(%e, "Result set aborted mid-stream");
            let payload = build_err(&e);
            self.send_payload(session, &payload).await?;
            return crate::protocol::packet::flush(&mut self.stream).await;
        }

        let eof = build_eof(0, session.status_flags());
        self.send_payload(session, &eof).await?;
        crate::protocol::packet::flush(&mut self.stream).await?;
        if one_shot {
            self.ctx.router.memory.commit(&txn)?;
        }

        // Feed cardinality feedback into the adaptive cost constants.
        self.ctx
            .optimizer
            .cost
            .observe(plan.est_rows().max(1.0), (rows.len() as f64).max(1.0));
        self.ctx
            .metrics
            .rows_returned
            .fetch_add(rows.len() as u64, std::sync::atomic::Ordering::Relaxed);

        if let Some(key) = cache_key {
            let mut tables = Vec::new();
            plan.scan_order(&mut tables);
            self.ctx.cache.put(key, schema, rows, tables);
        }
        Ok(())
    }

    // --- non-select statements ---

    async fn execute_statement(
        &mut self,
        session: &mut Session,
        statement: Statement,
    ) -> Result<Outcome> {
        match statement {
            Statement::Insert(insert) => self.execute_insert(session, insert).await,
            Statement::Update(update) => self.execute_update(session, update).await,
            Statement::Delete(delete) => self.execute_delete(session, delete).await,
            Statement::CreateTable(create) => self.execute_create_table(session, create).await,
            Statement::DropTable { name, if_exists } => {
                self.execute_drop_table(session, &name, if_exists).await
            }
            Statement::CreateIndex(create) => {
                self.ctx
                    .acl
                    .check(&session.username, Permission::DDL, &create.table)?;
                let desc = self.ctx.catalog.table(&session.database, &create.table)?;
                if desc.persistence.is_persistent() {
                    return Err(Error::Unsupported(
                        "CREATE INDEX on persistent tables".into(),
                    ));
                }
                self.ctx
                    .router
                    .memory
                    .create_index(&create.table, create.index.clone())?;
                let mut updated = (*desc).clone();
                updated.indexes.push(create.index);
                self.ctx.catalog.update_table(&session.database, updated)?;
                Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                })
            }
            Statement::Set { name, value } => {
                session.set_variable(&name, value);
                Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                })
            }
            Statement::Show(kind) => self.execute_show(session, kind),
            Statement::Use(db) => {
                self.switch_database(session, &db)?;
                Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                })
            }
            Statement::Begin => {
                if let Some(txn) = session.txn.take() {
                    // Implicit commit of the open transaction.
                    self.ctx.router.memory.commit(&txn)?;
                }
                let txn = self.ctx.router.memory.begin(Isolation::Snapshot)?;
                session.txn = Some(txn);
                Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                })
            }
            Statement::Commit => {
                if let Some(txn) = session.txn.take() {
                    self.ctx.router.memory.commit(&txn)?;
                    self.ctx
                        .metrics
                        .txns_committed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.rebuild_fts_indexes(session).await?;
                }
                Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                })
            }
            Statement::Rollback => {
                if let Some(txn) = session.txn.take() {
                    self.ctx.router.memory.rollback(&txn);
                    self.ctx
                        .metrics
                        .txns_aborted
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.rebuild_fts_indexes(session).await?;
                }
                Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                })
            }
            Statement::Analyze { table } => self.execute_analyze(session, &table).await,
            Statement::Ping => Ok(Outcome::Ok {
                affected: 0,
                last_insert_id: 0,
                info: None,
            }),
            Statement::Select(_) | Statement::Explain(_) => {
                Err(Error::Internal("SELECT handled by the streaming path".into()))
            }
        }
    }

    async fn execute_insert(&mut self, session: &mut Session, insert: InsertStmt) -> Result<Outcome> {
        self.ctx
            .acl
            .check(&session.username, Permission::WRITE, &insert.table)?;
        let desc = self.ctx.catalog.table(&session.database, &insert.table)?;
        let columns = if insert.columns.is_empty() {
            desc.column_names()
        } else {
            insert.columns.clone()
        };

        let empty = Row::from_pairs(vec![]);
        let mut rows = Vec::with_capacity(insert.rows.len());
        for exprs in &insert.rows {
            if exprs.len() != columns.len() {
                return Err(Error::Syntax(format!(
                    "expected {} values, got {}",
                    columns.len(),
                    exprs.len()
                )));
            }
            let mut pairs = Vec::with_capacity(exprs.len());
            for (column, expr) in columns.iter().zip(exprs) {
                pairs.push((column.clone(), constant_value(expr, &empty)?));
            }
            rows.push(Row::from_pairs(pairs));
        }

        let (txn, one_shot) = self.statement_txn(session)?;
        let result = self.ctx.router.insert(&txn, &insert.table, rows).await;
        let affected = self.finish_statement_txn(one_shot, &txn, result)?;

        self.after_write(session, &insert.table, &desc, one_shot).await?;
        Ok(Outcome::Ok {
            affected,
            last_insert_id: 0,
            info: None,
        })
    }

    async fn execute_update(&mut self, session: &mut Session, update: UpdateStmt) -> Result<Outcome> {
        self.ctx
            .acl
            .check(&session.username, Permission::WRITE, &update.table)?;
        let desc = self.ctx.catalog.table(&session.database, &update.table)?;

        let empty = Row::from_pairs(vec![]);
        let mut assignments = Vec::with_capacity(update.assignments.len());
        for (column, expr) in &update.assignments {
            assignments.push((column.clone(), constant_value(expr, &empty)?));
        }

        let (txn, one_shot) = self.statement_txn(session)?;
        let result = self
            .ctx
            .router
            .update(&txn, &update.table, &assignments, update.selection.as_ref())
            .await;
        let affected = self.finish_statement_txn(one_shot, &txn, result)?;

        self.after_write(session, &update.table, &desc, one_shot).await?;
        Ok(Outcome::Ok {
            affected,
            last_insert_id: 0,
            info: None,
        })
    }

    async fn execute_delete(&mut self, session: &mut Session, delete: DeleteStmt) -> Result<Outcome> {
        self.ctx
            .acl
            .check(&session.username, Permission::DELETE, &delete.table)?;
        let desc = self.ctx.catalog.table(&session.database, &delete.table)?;

        let (txn, one_shot) = self.statement_txn(session)?;
        let result = self
            .ctx
            .router
            .delete(&txn, &delete.table, delete.selection.as_ref())
            .await;
        let affected = self.finish_statement_txn(one_shot, &txn, result)?;

        self.after_write(session, &delete.table, &desc, one_shot).await?;
        Ok(Outcome::Ok {
            affected,
            last_insert_id: 0,
            info: None,
        })
    }

    async fn execute_create_table(
        &mut self,
        session: &mut Session,
        create: CreateTableStmt,
    ) -> Result<Outcome> {
        self.ctx
            .acl
            .check(&session.username, Permission::DDL, &create.name)?;

        if self.ctx.catalog.table(&session.database, &create.name).is_ok() {
            if create.if_not_exists {
                return Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                });
            }
            return Err(Error::Syntax(format!(
                "table '{}' already exists",
                create.name
            )));
        }

        if let Some(policy) = create.persistence {
            self.ctx.router.config.set_policy(&create.name, policy);
        }
        let mut primary_key = create.primary_key.clone();
        primary_key.dedup();
        let desc = TableDescriptor {
            name: create.name.clone(),
            columns: create.columns,
            primary_key,
            indexes: vec![],
            persistence: self.ctx.router.config.policy(&create.name),
            engine: Default::default(),
            fulltext: create.fulltext.clone(),
        };
        desc.validate()?;

        self.ctx.router.create_table(&desc).await?;
        if let Err(e) = self.ctx.catalog.register_table(&session.database, desc.clone()) {
            // Keep engine and catalog consistent.
            let _ = self.ctx.router.drop_table(&create.name).await;
            return Err(e);
        }
        if !desc.fulltext.is_empty() {
            self.ctx
                .fts
                .create(&create.name, desc.fulltext.clone(), "standard");
        }
        tracing::info!(table = %create.name, "Created table");
        Ok(Outcome::Ok {
            affected: 0,
            last_insert_id: 0,
            info: None,
        })
    }

    async fn execute_drop_table(
        &mut self,
        session: &mut Session,
        name: &str,
        if_exists: bool,
    ) -> Result<Outcome> {
        self.ctx.acl.check(&session.username, Permission::DDL, name)?;
        if self.ctx.catalog.table(&session.database, name).is_err() {
            if if_exists {
                return Ok(Outcome::Ok {
                    affected: 0,
                    last_insert_id: 0,
                    info: None,
                });
            }
            return Err(Error::TableNotFound(name.to_string()));
        }

        self.ctx.router.drop_table(name).await?;
        self.ctx.catalog.drop_table(&session.database, name)?;
        self.ctx.fts.drop_table(name);
        self.ctx.optimizer.stats.invalidate(name);
        self.ctx.cache.invalidate_tables(&[name.to_string()]);
        tracing::info!(table = name, "Dropped table");
        Ok(Outcome::Ok {
            affected: 0,
            last_insert_id: 0,
            info: None,
        })
    }

    fn execute_show(&self, session: &Session, kind: ShowKind) -> Result<Outcome> {
        let outcome = match kind {
            ShowKind::Databases => {
                let schema = vec![ColumnDescriptor::new("Database", SemanticType::String)];
                let rows = self
                    .ctx
                    .catalog
                    .databases()
                    .into_iter()
                    .map(|d| Row::from_pairs(vec![("Database".into(), Value::Str(d))]))
                    .collect();
                Outcome::ResultSet {
                    table: String::new(),
                    schema,
                    rows,
                }
            }
            ShowKind::Tables => {
                let column = format!("Tables_in_{}", session.database);
                let schema = vec![ColumnDescriptor::new(column.clone(), SemanticType::String)];
                let rows = self
                    .ctx
                    .catalog
                    .tables(&session.database)?
                    .into_iter()
                    .map(|t| Row::from_pairs(vec![(column.clone(), Value::Str(t))]))
                    .collect();
                Outcome::ResultSet {
                    table: String::new(),
                    schema,
                    rows,
                }
            }
            ShowKind::Variables => {
                let schema = vec![
                    ColumnDescriptor::new("Variable_name", SemanticType::String),
                    ColumnDescriptor::new("Value", SemanticType::String),
                ];
                let mut names: Vec<&String> = session.variables.keys().collect();
                names.sort();
                let mut rows: Vec<Row> = vec![Row::from_pairs(vec![
                    ("Variable_name".into(), Value::Str("autocommit".into())),
                    (
                        "Value".into(),
                        Value::Str(if session.autocommit { "ON" } else { "OFF" }.into()),
                    ),
                ])];
                for name in names {
                    let value = session.variables[name].to_text();
                    rows.push(Row::from_pairs(vec![
                        ("Variable_name".into(), Value::Str(name.clone())),
                        ("Value".into(), Value::Str(value)),
                    ]));
                }
                Outcome::ResultSet {
                    table: String::new(),
                    schema,
                    rows,
                }
            }
        };
        Ok(outcome)
    }

    async fn execute_analyze(&mut self, session: &mut Session, table: &str) -> Result<Outcome> {
        let _ = self.ctx.catalog.table(&session.database, table)?;
        let txn = self.ctx.router.memory.begin(Isolation::Snapshot)?;
        let rows = self
            .ctx
            .router
            .scan(&txn, table, &ScanRequest::default())
            .await;
        self.ctx.router.memory.rollback(&txn);
        let rows = rows?;
        let stats = crate::optimizer::stats::TableStats::analyze(table, &rows);
        let total = stats.total_rows;
        self.ctx.optimizer.stats.put(stats);
        Ok(Outcome::Ok {
            affected: 0,
            last_insert_id: 0,
            info: Some(format!("analyzed {total} rows")),
        })
    }

    /// Post-write upkeep: cache invalidation and full-text reindexing.
    async fn after_write(
        &mut self,
        session: &mut Session,
        table: &str,
        desc: &TableDescriptor,
        committed: bool,
    ) -> Result<()> {
        self.ctx.cache.invalidate_tables(&[table.to_string()]);
        if committed && !desc.fulltext.is_empty() {
            self.rebuild_fts_table(session, table).await?;
        }
        Ok(())
    }

    /// Rebuild the full-text index of one table from a fresh snapshot.
    async fn rebuild_fts_table(&mut self, session: &Session, table: &str) -> Result<()> {
        let desc = self.ctx.catalog.table(&session.database, table)?;
        if desc.fulltext.is_empty() {
            return Ok(());
        }
        let pk = desc
            .primary_key
            .first()
            .ok_or_else(|| Error::Unsupported("FULLTEXT requires a primary key".into()))?
            .clone();
        let txn = self.ctx.router.memory.begin(Isolation::Snapshot)?;
        let rows = self
            .ctx
            .router
            .scan(&txn, table, &ScanRequest::default())
            .await;
        self.ctx.router.memory.rollback(&txn);
        let rows = rows?;

        self.ctx.fts.create(table, desc.fulltext.clone(), "standard");
        for row in &rows {
            self.ctx.fts.index_row(table, row, &pk)?;
        }
        Ok(())
    }

    /// After explicit COMMIT/ROLLBACK, bring every full-text table back in
    /// line with the now-visible state.
    async fn rebuild_fts_indexes(&mut self, session: &Session) -> Result<()> {
        for table in self.ctx.catalog.tables(&session.database)? {
            let desc = self.ctx.catalog.table(&session.database, &table)?;
            if !desc.fulltext.is_empty() {
                self.rebuild_fts_table(session, &table).await?;
            }
        }
        Ok(())
    }

    // --- COM_FIELD_LIST / prepared statements ---

    async fn handle_field_list(&mut self, session: &mut Session, payload: &[u8]) -> Result<()> {
        let mut reader = PayloadReader::new(&payload[1..]);
        let table = String::from_utf8_lossy(reader.read_null_terminated().unwrap_or(b""))
            .to_string();
        let desc = self.ctx.catalog.table(&session.database, &table)?;
        let database = session.database.clone();
        for column in &desc.columns {
            let payload = build_column_definition(&database, &table, column);
            self.send_payload(session, &payload).await?;
        }
        let eof = build_eof(0, session.status_flags());
        self.send_payload(session, &eof).await?;
        crate::protocol::packet::flush(&mut self.stream).await
    }

    async fn handle_stmt_prepare(&mut self, session: &mut Session, sql: &str) -> Result<()> {
        let statement = parse::parse(sql)?;
        let num_params = count_placeholders(&statement);
        let columns: Schema = match &statement {
            Statement::Select(select) => self
                .plan_select(session, select)
                .map(|p| p.schema().clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let stmt_id = session.add_prepared(
            sql.to_string(),
            statement,
            num_params,
            columns.clone(),
        );

        let header = build_stmt_prepare_ok(stmt_id, columns.len() as u16, num_params);
        self.send_payload(session, &header).await?;
        let database = session.database.clone();

        if num_params > 0 {
            let param = ColumnDescriptor::new("?", SemanticType::String);
            for _ in 0..num_params {
                let payload = build_column_definition(&database, "", &param);
                self.send_payload(session, &payload).await?;
            }
            let eof = build_eof(0, session.status_flags());
            self.send_payload(session, &eof).await?;
        }
        if !columns.is_empty() {
            for column in &columns {
                let payload = build_column_definition(&database, "", column);
                self.send_payload(session, &payload).await?;
            }
            let eof = build_eof(0, session.status_flags());
            self.send_payload(session, &eof).await?;
        }
        crate::protocol::packet::flush(&mut self.stream).await
    }

    async fn handle_stmt_execute(&mut self, session: &mut Session, payload: &[u8]) -> Result<()> {
        let mut reader = PayloadReader::new(&payload[1..]);
        let stmt_id = reader.read_u32_le()?;
        reader.skip(1)?; // flags
        reader.skip(4)?; // iteration count

        let prepared = session
            .prepared
            .get(&stmt_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown prepared statement id {stmt_id}")))?;

        let params = if prepared.num_params > 0 {
            parse_binary_params(&mut reader, prepared.num_params as usize)?
        } else {
            Vec::new()
        };
        let bound = bind_statement_params(&prepared.statement, &params)?;
        self.execute(session, bound, None, true).await
    }
}

/// Evaluate an expression that must not reference row columns (INSERT
/// values, SET assignments).
fn constant_value(expr: &Expr, empty: &Row) -> Result<Value> {
    match rowset::eval_expr(expr, empty) {
        Ok(v) => Ok(v),
        Err(Error::UnknownColumn(c)) => Err(Error::Unsupported(format!(
            "column reference '{c}' is not allowed here"
        ))),
        Err(e) => Err(e),
    }
}

/// Number of `?` placeholders in a statement.
fn count_placeholders(statement: &Statement) -> u16 {
    fn walk_expr(e: &Expr, max: &mut usize) {
        match e {
            Expr::Placeholder(i) => *max = (*max).max(i + 1),
            Expr::Binary { left, right, .. } => {
                walk_expr(left, max);
                walk_expr(right, max);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => walk_expr(expr, max),
            Expr::InList { expr, list, .. } => {
                walk_expr(expr, max);
                list.iter().for_each(|e| walk_expr(e, max));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                walk_expr(expr, max);
                walk_expr(low, max);
                walk_expr(high, max);
            }
            Expr::Like { expr, pattern, .. } => {
                walk_expr(expr, max);
                walk_expr(pattern, max);
            }
            Expr::Function { args, .. } => args.iter().for_each(|e| walk_expr(e, max)),
            Expr::InSubquery { expr, subquery, .. } => {
                walk_expr(expr, max);
                walk_select(subquery, max);
            }
            _ => {}
        }
    }
    fn walk_select(s: &SelectStmt, max: &mut usize) {
        for item in &s.projection {
            if let SelectItem::Expr { expr, .. } = item {
                walk_expr(expr, max);
            }
        }
        if let Some(from) = &s.from {
            for j in &from.joins {
                if let Some(on) = &j.on {
                    walk_expr(on, max);
                }
            }
        }
        if let Some(sel) = &s.selection {
            walk_expr(sel, max);
        }
        for e in &s.group_by {
            walk_expr(e, max);
        }
        if let Some(h) = &s.having {
            walk_expr(h, max);
        }
        for o in &s.order_by {
            walk_expr(&o.expr, max);
        }
        for (branch, _) in &s.unions {
            walk_select(branch, max);
        }
    }

    let mut max = 0usize;
    match statement {
        Statement::Select(s) => walk_select(s, &mut max),
        Statement::Explain(s) => walk_select(s, &mut max),
        Statement::Insert(i) => {
            for row in &i.rows {
                row.iter().for_each(|e| walk_expr(e, &mut max));
            }
        }
        Statement::Update(u) => {
            for (_, e) in &u.assignments {
                walk_expr(e, &mut max);
            }
            if let Some(sel) = &u.selection {
                walk_expr(sel, &mut max);
            }
        }
        Statement::Delete(d) => {
            if let Some(sel) = &d.selection {
                walk_expr(sel, &mut max);
            }
        }
        _ => {}
    }
    max as u16
}

/// Replace placeholders with bound parameter values.
pub(crate) fn bind_statement_params(statement: &Statement, params: &[Value]) -> Result<Statement> {
    fn bind_expr(e: &Expr, params: &[Value]) -> Result<Expr> {
        Ok(match e {
            Expr::Placeholder(i) => Expr::Literal(
                params
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| Error::Protocol(format!("missing parameter {i}")))?,
            ),
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(bind_expr(left, params)?),
                op: *op,
                right: Box::new(bind_expr(right, params)?),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(bind_expr(expr, params)?),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(bind_expr(expr, params)?),
                negated: *negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(bind_expr(expr, params)?),
                list: list
                    .iter()
                    .map(|e| bind_expr(e, params))
                    .collect::<Result<_>>()?,
                negated: *negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(bind_expr(expr, params)?),
                low: Box::new(bind_expr(low, params)?),
                high: Box::new(bind_expr(high, params)?),
                negated: *negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(bind_expr(expr, params)?),
                pattern: Box::new(bind_expr(pattern, params)?),
                negated: *negated,
            },
            Expr::Function {
                name,
                args,
                wildcard,
            } => Expr::Function {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|e| bind_expr(e, params))
                    .collect::<Result<_>>()?,
                wildcard: *wildcard,
            },
            other => other.clone(),
        })
    }

    fn bind_select(s: &SelectStmt, params: &[Value]) -> Result<SelectStmt> {
        let mut out = s.clone();
        for item in &mut out.projection {
            if let SelectItem::Expr { expr, .. } = item {
                *expr = bind_expr(expr, params)?;
            }
        }
        if let Some(from) = &mut out.from {
            for j in &mut from.joins {
                if let Some(on) = &mut j.on {
                    *on = bind_expr(on, params)?;
                }
            }
        }
        if let Some(sel) = &mut out.selection {
            *sel = bind_expr(sel, params)?;
        }
        for e in &mut out.group_by {
            *e = bind_expr(e, params)?;
        }
        if let Some(h) = &mut out.having {
            *h = bind_expr(h, params)?;
        }
        for o in &mut out.order_by {
            o.expr = bind_expr(&o.expr, params)?;
        }
        for (branch, _) in &mut out.unions {
            *branch = bind_select(branch, params)?;
        }
        Ok(out)
    }

    Ok(match statement {
        Statement::Select(s) => Statement::Select(bind_select(s, params)?),
        Statement::Explain(s) => Statement::Explain(Box::new(bind_select(s, params)?)),
        Statement::Insert(i) => {
            let mut out = i.clone();
            for row in &mut out.rows {
                for e in row.iter_mut() {
                    *e = bind_expr(e, params)?;
                }
            }
            Statement::Insert(out)
        }
        Statement::Update(u) => {
            let mut out = u.clone();
            for (_, e) in &mut out.assignments {
                *e = bind_expr(e, params)?;
            }
            if let Some(sel) = &mut out.selection {
                *sel = bind_expr(sel, params)?;
            }
            Statement::Update(out)
        }
        Statement::Delete(d) => {
            let mut out = d.clone();
            if let Some(sel) = &mut out.selection {
                *sel = bind_expr(sel, params)?;
            }
            Statement::Delete(out)
        }
        other => other.clone(),
    })
}

/// Decode COM_STMT_EXECUTE binary parameters.
fn parse_binary_params(reader: &mut PayloadReader<'_>, count: usize) -> Result<Vec<Value>> {
    let bitmap_len = (count + 7) / 8;
    let bitmap = reader.read_bytes(bitmap_len)?.to_vec();
    let new_params_bound = reader.read_u8()?;
    if new_params_bound != 1 {
        return Err(Error::Protocol(
            "statement executed without bound parameter types".into(),
        ));
    }
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        let type_byte = reader.read_u8()?;
        let flags = reader.read_u8()?;
        types.push((type_byte, flags & 0x80 != 0));
    }

    let mut params = Vec::with_capacity(count);
    for (i, (type_byte, unsigned)) in types.into_iter().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            params.push(Value::Null);
            continue;
        }
        let value = match type_byte {
            t if t == column_type::TINY => {
                let v = reader.read_u8()?;
                if unsigned {
                    Value::Uint(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i8))
                }
            }
            2 => {
                // SHORT
                let v = reader.read_u16_le()?;
                if unsigned {
                    Value::Uint(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i16))
                }
            }
            t if t == column_type::LONG => {
                let v = reader.read_u32_le()?;
                if unsigned {
                    Value::Uint(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i32))
                }
            }
            t if t == column_type::LONGLONG => {
                let v = reader.read_u64_le()?;
                if unsigned {
                    Value::Uint(v)
                } else {
                    Value::Int(v as i64)
                }
            }
            4 => {
                // FLOAT
                let bits = reader.read_u32_le()?;
                Value::Float(f64::from(f32::from_bits(bits)))
            }
            t if t == column_type::DOUBLE => Value::Float(reader.read_f64_le()?),
            6 => Value::Null, // NULL type
            _ => {
                // Everything else arrives length-encoded.
                let bytes = reader.read_lenenc_bytes()?;
                match std::str::from_utf8(bytes) {
                    Ok(s) => Value::Str(s.to_string()),
                    Err(_) => Value::Bytes(bytes.to_vec()),
                }
            }
        };
        params.push(value);
    }
    Ok(params)
}


#[cfg(test)]
mod e2e {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::protocol::constants::Capabilities;
    use crate::protocol::packet::{put_null_terminated, read_packet as read_pkt, write_packet as write_pkt, Packet};
    use tokio::io::{AsyncReadExt, DuplexStream};

    async fn start_gateway() -> (Arc<GatewayContext>, DuplexStream) {
        start_gateway_with(GatewayConfig::default(), None).await
    }

    async fn start_gateway_with(
        config: GatewayConfig,
        data_dir: Option<&std::path::Path>,
    ) -> (Arc<GatewayContext>, DuplexStream) {
        let ctx = GatewayContext::new(config, data_dir).await.unwrap();
        let (client, server) = tokio::io::duplex(1 << 20);
        let session = ctx.sessions.create();
        let handler = ConnectionHandler::new(server, Arc::clone(&ctx), session);
        tokio::spawn(handler.run());
        (ctx, client)
    }

    async fn do_handshake(client: &mut DuplexStream) -> Packet {
        let handshake = read_pkt(client).await.unwrap();
        assert_eq!(handshake.header.sequence_id, 0);
        assert_eq!(handshake.payload[0], 10, "protocol version");
        let version_end = handshake.payload[1..]
            .iter()
            .position(|&b| b == 0)
            .unwrap();
        let version =
            std::str::from_utf8(&handshake.payload[1..1 + version_end]).unwrap();
        assert_eq!(version, "SqlExc");

        let caps = Capabilities::PROTOCOL_41 | Capabilities::SECURE_CONNECTION;
        let mut payload = Vec::new();
        payload.extend_from_slice(&caps.bits().to_le_bytes());
        payload.extend_from_slice(&(16u32 * 1024 * 1024).to_le_bytes());
        payload.push(45);
        payload.extend_from_slice(&[0u8; 23]);
        put_null_terminated(&mut payload, b"root");
        payload.push(0); // empty auth response (open mode)
        write_pkt(client, 1, &payload).await.unwrap();

        let ok = read_pkt(client).await.unwrap();
        assert_eq!(ok.payload[0], 0x00, "authentication OK");
        assert_eq!(ok.header.sequence_id, 2);
        handshake
    }

    fn is_eof(p: &Packet) -> bool {
        p.payload.first() == Some(&0xfe) && p.payload.len() < 9
    }

    /// Send COM_QUERY and collect the full response packet train.
    async fn query(client: &mut DuplexStream, sql: &str) -> Vec<Packet> {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        write_pkt(client, 0, &payload).await.unwrap();

        let first = read_pkt(client).await.unwrap();
        match first.payload.first() {
            Some(0x00) | Some(0xff) => return vec![first],
            _ => {}
        }
        let mut packets = vec![first];
        // Column definitions up to the first EOF.
        loop {
            let p = read_pkt(client).await.unwrap();
            let done = is_eof(&p);
            packets.push(p);
            if done {
                break;
            }
        }
        // Rows up to the terminal EOF (or an in-band ERR).
        loop {
            let p = read_pkt(client).await.unwrap();
            let done = is_eof(&p) || p.payload.first() == Some(&0xff);
            packets.push(p);
            if done {
                break;
            }
        }
        packets
    }

    fn decode_row_values(p: &Packet) -> Vec<Option<String>> {
        let mut out = Vec::new();
        let mut reader = PayloadReader::new(&p.payload);
        while reader.remaining() > 0 {
            if reader.peek_u8() == Some(0xfb) {
                reader.read_u8().unwrap();
                out.push(None);
            } else {
                let bytes = reader.read_lenenc_bytes().unwrap();
                out.push(Some(String::from_utf8_lossy(bytes).into_owned()));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_then_quit() {
        let (_ctx, mut client) = start_gateway().await;
        let handshake = do_handshake(&mut client).await;
        // Thread id of the first connection is 1.
        let thread_id = u32::from_le_bytes(
            handshake.payload[8..12].try_into().unwrap(),
        );
        assert_eq!(thread_id, 1);

        write_pkt(&mut client, 0, &[0x01]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "server closed the connection after COM_QUIT");
    }

    #[tokio::test]
    async fn test_two_pings_each_ok_with_seq_one() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        for _ in 0..2 {
            write_pkt(&mut client, 0, &[0x0e]).await.unwrap();
            let ok = read_pkt(&mut client).await.unwrap();
            assert_eq!(ok.payload[0], 0x00);
            assert_eq!(ok.header.sequence_id, 1);
        }
    }

    #[tokio::test]
    async fn test_select_on_memory_table() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;

        let r = query(
            &mut client,
            "CREATE TABLE users(id INT PRIMARY KEY, name VARCHAR(100))",
        )
        .await;
        assert_eq!(r[0].payload[0], 0x00, "create ok");

        let r = query(&mut client, "INSERT INTO users VALUES (1,'Alice'),(2,'Bob')").await;
        assert_eq!(r[0].payload[0], 0x00, "insert ok");

        let packets = query(&mut client, "SELECT id, name FROM users WHERE id > 1").await;
        // column-count, 2 column defs, EOF, 1 row, EOF
        assert_eq!(packets.len(), 6, "framing: {packets:?}");
        assert_eq!(packets[0].payload, vec![2], "two columns");
        assert!(is_eof(&packets[3]));
        assert!(is_eof(&packets[5]));
        let row = decode_row_values(&packets[4]);
        assert_eq!(row, vec![Some("2".into()), Some("Bob".into())]);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(
                p.header.sequence_id,
                (i + 1) as u8,
                "strictly increasing sequence ids"
            );
        }
    }

    #[tokio::test]
    async fn test_syntax_error_not_injection() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        let r = query(&mut client, "SELECT * FROM users WHERE name = 'Alice").await;
        assert_eq!(r[0].payload[0], 0xff);
        let code = u16::from_le_bytes([r[0].payload[1], r[0].payload[2]]);
        assert_eq!(code, 1064);
        // Connection survives a syntax error.
        write_pkt(&mut client, 0, &[0x0e]).await.unwrap();
        let ok = read_pkt(&mut client).await.unwrap();
        assert_eq!(ok.payload[0], 0x00);
    }

    #[tokio::test]
    async fn test_unknown_table_keeps_connection() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        let r = query(&mut client, "SELECT * FROM missing").await;
        assert_eq!(r[0].payload[0], 0xff);
        let code = u16::from_le_bytes([r[0].payload[1], r[0].payload[2]]);
        assert_eq!(code, 1146);
        assert_eq!(&r[0].payload[4..9], b"42S02");
    }

    #[tokio::test]
    async fn test_explain_join_order_after_analyze() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;

        for (table, rows) in [("a", 100usize), ("b", 10), ("c", 1000)] {
            let r = query(
                &mut client,
                &format!("CREATE TABLE {table}(k INT PRIMARY KEY, v VARCHAR(20))"),
            )
            .await;
            assert_eq!(r[0].payload[0], 0x00);
            let values: Vec<String> =
                (0..rows).map(|i| format!("({i},'v{}')", i % 7)).collect();
            let r = query(
                &mut client,
                &format!("INSERT INTO {table} VALUES {}", values.join(",")),
            )
            .await;
            assert_eq!(r[0].payload[0], 0x00);
            let r = query(&mut client, &format!("ANALYZE TABLE {table}")).await;
            assert_eq!(r[0].payload[0], 0x00);
        }

        let packets = query(
            &mut client,
            "EXPLAIN SELECT * FROM a JOIN b ON a.k = b.k JOIN c ON b.k = c.k",
        )
        .await;
        let plan_text: Vec<String> = packets
            .iter()
            .skip(3)
            .filter(|p| !is_eof(p))
            .map(|p| decode_row_values(p)[0].clone().unwrap())
            .collect();
        let joined = plan_text.join("\n");
        assert!(
            joined.contains("b ⋈ a ⋈ c"),
            "smallest intermediate first:\n{joined}"
        );
    }

    #[tokio::test]
    async fn test_transactions_over_wire() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE t(id INT PRIMARY KEY)").await;
        query(&mut client, "INSERT INTO t VALUES (1)").await;

        query(&mut client, "BEGIN").await;
        query(&mut client, "INSERT INTO t VALUES (2)").await;
        query(&mut client, "ROLLBACK").await;
        let packets = query(&mut client, "SELECT COUNT(*) AS n FROM t").await;
        let row = decode_row_values(&packets[3]);
        assert_eq!(row, vec![Some("1".into())], "rollback undid the insert");

        query(&mut client, "BEGIN").await;
        query(&mut client, "INSERT INTO t VALUES (3)").await;
        query(&mut client, "COMMIT").await;
        let packets = query(&mut client, "SELECT COUNT(*) AS n FROM t").await;
        let row = decode_row_values(&packets[3]);
        assert_eq!(row, vec![Some("2".into())]);
    }

    #[tokio::test]
    async fn test_persistence_toggle_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (ctx, mut client) =
                start_gateway_with(GatewayConfig::default(), Some(dir.path())).await;
            do_handshake(&mut client).await;
            ctx.router.config.enable_persistence("products", false, false);
            query(
                &mut client,
                "CREATE TABLE products(id INT PRIMARY KEY, name VARCHAR(50))",
            )
            .await;
            query(&mut client, "INSERT INTO products VALUES (1,'anvil')").await;
            // A memory-only table created alongside.
            query(&mut client, "CREATE TABLE scratch(id INT PRIMARY KEY)").await;
            query(&mut client, "INSERT INTO scratch VALUES (1)").await;
        }

        // Restart: a fresh gateway over the same data directory.
        let (_ctx, mut client) =
            start_gateway_with(GatewayConfig::default(), Some(dir.path())).await;
        do_handshake(&mut client).await;
        let packets = query(&mut client, "SELECT id, name FROM products").await;
        assert_eq!(packets[0].payload, vec![2]);
        let row = decode_row_values(&packets[4]);
        assert_eq!(row, vec![Some("1".into()), Some("anvil".into())]);

        // The memory table did not survive.
        let r = query(&mut client, "SELECT * FROM scratch").await;
        assert_eq!(r[0].payload[0], 0xff);
    }

    #[tokio::test]
    async fn test_match_against_ranks_doc1_first() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(
            &mut client,
            "CREATE TABLE docs(id INT PRIMARY KEY, body TEXT, FULLTEXT (body))",
        )
        .await;
        let r = query(
            &mut client,
            "INSERT INTO docs VALUES (1,'the quick brown fox'),(2,'a lazy dog'),(3,'quick dog')",
        )
        .await;
        assert_eq!(r[0].payload[0], 0x00);

        let packets = query(
            &mut client,
            "SELECT id FROM docs WHERE MATCH(body) AGAINST ('quick fox')",
        )
        .await;
        let rows: Vec<Vec<Option<String>>> = packets
            .iter()
            .skip(3)
            .filter(|p| !is_eof(p))
            .map(decode_row_values)
            .collect();
        assert!(!rows.is_empty());
        assert_eq!(rows[0], vec![Some("1".into())], "doc 1 ranks first: {rows:?}");
    }

    #[tokio::test]
    async fn test_show_and_use() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE zt(id INT PRIMARY KEY)").await;

        let packets = query(&mut client, "SHOW TABLES").await;
        let rows: Vec<Vec<Option<String>>> = packets
            .iter()
            .skip(2)
            .filter(|p| !is_eof(p))
            .map(decode_row_values)
            .collect();
        assert!(rows.iter().any(|r| r[0].as_deref() == Some("zt")));

        let r = query(&mut client, "USE nonexistent").await;
        assert_eq!(r[0].payload[0], 0xff);
        let code = u16::from_le_bytes([r[0].payload[1], r[0].payload[2]]);
        assert_eq!(code, 1049);

        query(&mut client, "SET myvar = 7").await;
        let packets = query(&mut client, "SHOW VARIABLES").await;
        let rows: Vec<Vec<Option<String>>> = packets
            .iter()
            .skip(3)
            .filter(|p| !is_eof(p))
            .map(decode_row_values)
            .collect();
        assert!(rows
            .iter()
            .any(|r| r[0].as_deref() == Some("myvar") && r[1].as_deref() == Some("7")));
    }

    #[tokio::test]
    async fn test_prepared_statement_round_trip() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE users(id INT PRIMARY KEY, name VARCHAR(50))").await;
        query(&mut client, "INSERT INTO users VALUES (1,'Alice'),(2,'Bob')").await;

        // COM_STMT_PREPARE
        let mut payload = vec![0x16];
        payload.extend_from_slice(b"SELECT name FROM users WHERE id = ?");
        write_pkt(&mut client, 0, &payload).await.unwrap();
        let prepare_ok = read_pkt(&mut client).await.unwrap();
        assert_eq!(prepare_ok.payload[0], 0x00);
        let stmt_id = u32::from_le_bytes(prepare_ok.payload[1..5].try_into().unwrap());
        let num_columns = u16::from_le_bytes(prepare_ok.payload[5..7].try_into().unwrap());
        let num_params = u16::from_le_bytes(prepare_ok.payload[7..9].try_into().unwrap());
        assert_eq!(num_params, 1);
        // Drain param definitions + EOF, column definitions + EOF.
        for _ in 0..(num_params as usize + 1) {
            read_pkt(&mut client).await.unwrap();
        }
        if num_columns > 0 {
            for _ in 0..(num_columns as usize + 1) {
                read_pkt(&mut client).await.unwrap();
            }
        }

        // COM_STMT_EXECUTE with id = 2 as a LONGLONG parameter.
        let mut payload = vec![0x17];
        payload.extend_from_slice(&stmt_id.to_le_bytes());
        payload.push(0); // flags
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(0x00); // null bitmap
        payload.push(0x01); // new params bound
        payload.extend_from_slice(&[8, 0]); // LONGLONG
        payload.extend_from_slice(&2i64.to_le_bytes());
        write_pkt(&mut client, 0, &payload).await.unwrap();

        // Response: column count, 1 def, EOF, 1 binary row, EOF.
        let count = read_pkt(&mut client).await.unwrap();
        assert_eq!(count.payload, vec![1]);
        let _def = read_pkt(&mut client).await.unwrap();
        let eof = read_pkt(&mut client).await.unwrap();
        assert!(is_eof(&eof));
        let row = read_pkt(&mut client).await.unwrap();
        assert_eq!(row.payload[0], 0x00, "binary row header");
        assert!(row.payload.ends_with(b"Bob"), "{:?}", row.payload);
        let eof = read_pkt(&mut client).await.unwrap();
        assert!(is_eof(&eof));

        // COM_STMT_CLOSE has no response; a following ping still works.
        let mut payload = vec![0x19];
        payload.extend_from_slice(&stmt_id.to_le_bytes());
        write_pkt(&mut client, 0, &payload).await.unwrap();
        write_pkt(&mut client, 0, &[0x0e]).await.unwrap();
        let ok = read_pkt(&mut client).await.unwrap();
        assert_eq!(ok.payload[0], 0x00);
    }

    #[tokio::test]
    async fn test_permissions_enforced_over_wire() {
        let (ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE users(id INT PRIMARY KEY)").await;
        query(&mut client, "INSERT INTO users VALUES (1)").await;

        // Grant READ|WRITE to root; DELETE stays denied (independent bits).
        ctx.acl.grant(
            "root",
            "users",
            crate::auth::Permission::READ | crate::auth::Permission::WRITE,
        );
        let r = query(&mut client, "SELECT * FROM users").await;
        assert_ne!(r[0].payload[0], 0xff, "read allowed");
        let r = query(&mut client, "INSERT INTO users VALUES (2)").await;
        assert_eq!(r[0].payload[0], 0x00, "write allowed");
        let r = query(&mut client, "DELETE FROM users WHERE id = 1").await;
        assert_eq!(r[0].payload[0], 0xff, "delete denied");
    }

    #[tokio::test]
    async fn test_left_join_pads_unmatched_with_null() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE l(k INT PRIMARY KEY, a VARCHAR(10))").await;
        query(&mut client, "CREATE TABLE r(k INT PRIMARY KEY, b VARCHAR(10))").await;
        query(&mut client, "INSERT INTO l VALUES (1,'x'),(2,'y')").await;
        query(&mut client, "INSERT INTO r VALUES (1,'z')").await;

        let packets = query(
            &mut client,
            "SELECT l.k, r.b FROM l LEFT JOIN r ON l.k = r.k ORDER BY l.k",
        )
        .await;
        let rows: Vec<Vec<Option<String>>> = packets
            .iter()
            .skip(4)
            .filter(|p| !is_eof(p))
            .map(decode_row_values)
            .collect();
        assert_eq!(rows.len(), 2, "{packets:?}");
        assert_eq!(rows[0], vec![Some("1".into()), Some("z".into())]);
        assert_eq!(rows[1], vec![Some("2".into()), None], "unmatched row padded");
    }

    #[tokio::test]
    async fn test_union_distinct_and_all() {
        let (_ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE u(id INT PRIMARY KEY)").await;
        query(&mut client, "INSERT INTO u VALUES (1),(2)").await;

        let packets = query(
            &mut client,
            "SELECT id FROM u UNION SELECT id FROM u ORDER BY id",
        )
        .await;
        let rows: Vec<Vec<Option<String>>> = packets
            .iter()
            .skip(3)
            .filter(|p| !is_eof(p))
            .map(decode_row_values)
            .collect();
        assert_eq!(rows.len(), 2, "UNION deduplicates: {rows:?}");

        let packets = query(
            &mut client,
            "SELECT id FROM u UNION ALL SELECT id FROM u",
        )
        .await;
        let rows: Vec<Vec<Option<String>>> = packets
            .iter()
            .skip(3)
            .filter(|p| !is_eof(p))
            .map(decode_row_values)
            .collect();
        assert_eq!(rows.len(), 4, "UNION ALL keeps duplicates: {rows:?}");
    }

    #[tokio::test]
    async fn test_query_cache_serves_repeat_select() {
        let (ctx, mut client) = start_gateway().await;
        do_handshake(&mut client).await;
        query(&mut client, "CREATE TABLE t(id INT PRIMARY KEY)").await;
        query(&mut client, "INSERT INTO t VALUES (1)").await;

        let first = query(&mut client, "SELECT * FROM t").await;
        let second = query(&mut client, "SELECT * FROM t").await;
        assert_eq!(first.len(), second.len());
        assert!(
            ctx.metrics.cache_hits.load(std::sync::atomic::Ordering::Relaxed) >= 1,
            "second select served from cache"
        );

        // Writes invalidate.
        query(&mut client, "INSERT INTO t VALUES (2)").await;
        let third = query(&mut client, "SELECT * FROM t").await;
        assert_eq!(third.len(), first.len() + 1, "fresh rows after invalidation");
    }
}
