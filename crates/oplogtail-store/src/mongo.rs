//! MongoDB-backed oplog store

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::future;
use mongodb::bson::{self, Bson, Document, Timestamp, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, CursorType, FindOneOptions, FindOptions, Tls, TlsOptions};
use mongodb::{Client, Collection, Database};
use tracing::{debug, info, warn};

use oplogtail_types::{LogEntry, LogPosition, NamespaceMatcher};

use crate::{
    ConnectOptions, Connector, CursorOptions, EntryStream, OplogCollection, OplogConnection,
    OplogQuery, QueryFilter, StoreError, TlsSettings,
};

/// Database holding the oplog
const OPLOG_DATABASE: &str = "local";

/// Connects to a MongoDB deployment by URI
pub struct MongoConnector {
    uri: String,
    options: ConnectOptions,
}

impl MongoConnector {
    pub fn new(uri: impl Into<String>, options: ConnectOptions) -> Self {
        Self {
            uri: uri.into(),
            options,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn client_options(&self) -> Result<ClientOptions, StoreError> {
        let mut client_options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        if let Some(replica_set) = &self.options.replica_set {
            client_options.repl_set_name = Some(replica_set.clone());
        }

        let tls = &self.options.tls;
        if tls.is_enabled() {
            if tls.key_password.is_some() {
                warn!("encrypted client keys are not supported; the key passphrase is ignored");
            }
            let cert_key_file = cert_key_file(tls);
            client_options.tls = Some(Tls::Enabled(
                TlsOptions::builder()
                    .ca_file_path(tls.ca_file.clone())
                    .cert_key_file_path(cert_key_file)
                    .build(),
            ));
        }

        Ok(client_options)
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self) -> Result<Arc<dyn OplogConnection>, StoreError> {
        let client_options = self.client_options().await?;
        let client =
            Client::with_options(client_options).map_err(|e| StoreError::Connect(e.to_string()))?;
        let database = client.database(OPLOG_DATABASE);

        // The driver connects lazily; ping so failures surface here
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        info!(uri = %self.uri, "connected to oplog database");
        Ok(Arc::new(MongoConnection {
            _client: client,
            database,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MongoConnection {
    /// Keeps the connection pool alive for as long as the connection is held
    _client: Client,
    database: Database,
    closed: AtomicBool,
}

#[async_trait]
impl OplogConnection for MongoConnection {
    fn collection(&self, name: &str) -> Result<Arc<dyn OplogCollection>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(Arc::new(MongoCollection {
            collection: self.database.collection::<Document>(name),
        }))
    }

    async fn close(&self, force: bool) -> Result<(), StoreError> {
        // Pooled sockets are released when the last client handle drops
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(force, "oplog connection closed");
        }
        Ok(())
    }
}

struct MongoCollection {
    collection: Collection<Document>,
}

#[async_trait]
impl OplogCollection for MongoCollection {
    async fn find(
        &self,
        query: &OplogQuery,
        options: &CursorOptions,
    ) -> Result<EntryStream, StoreError> {
        let filter = build_filter(query)?;
        let cursor_type = match (options.tailable, options.await_data) {
            (true, true) => CursorType::TailableAwait,
            (true, false) => CursorType::Tailable,
            (false, _) => CursorType::NonTailable,
        };
        let find_options = FindOptions::builder()
            .cursor_type(cursor_type)
            .no_cursor_timeout(options.no_cursor_timeout)
            .build();

        debug!(filter = %filter, "opening oplog cursor");
        let cursor = self
            .collection
            .find(filter, find_options)
            .await
            .map_err(cursor_error)?;

        Ok(cursor
            .filter_map(|item| future::ready(decode_item(item)))
            .boxed())
    }

    async fn find_last(
        &self,
        namespace: Option<&NamespaceMatcher>,
    ) -> Result<Option<LogEntry>, StoreError> {
        let filter = namespace
            .filter(|m| !m.matches_everything())
            .map(namespace_condition)
            .unwrap_or_default();
        let find_options = FindOneOptions::builder()
            .sort(doc! { "$natural": -1 })
            .build();

        let doc = self
            .collection
            .find_one(filter, find_options)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        doc.as_ref().map(entry_from_document).transpose()
    }
}

fn namespace_condition(matcher: &NamespaceMatcher) -> Document {
    doc! { "ns": { "$regex": matcher.regex_source(), "$options": "i" } }
}

fn build_filter(query: &OplogQuery) -> Result<Document, StoreError> {
    let after = doc! {
        "ts": {
            "$gt": Timestamp {
                time: query.after.seconds(),
                increment: query.after.increment(),
            }
        }
    };

    match &query.filter {
        QueryFilter::All => Ok(after),
        QueryFilter::Namespace(matcher) => {
            let mut filter = after;
            filter.insert(
                "ns",
                doc! { "$regex": matcher.regex_source(), "$options": "i" },
            );
            Ok(filter)
        }
        QueryFilter::Raw(raw) => {
            let raw = bson::to_document(raw).map_err(|e| StoreError::Query(e.to_string()))?;
            Ok(doc! { "$and": [after, raw] })
        }
    }
}

fn cursor_error(err: mongodb::error::Error) -> StoreError {
    let code = match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    };
    StoreError::Cursor {
        message: err.to_string(),
        code,
    }
}

/// The driver expects the certificate and key in one PEM file
fn cert_key_file(tls: &TlsSettings) -> Option<PathBuf> {
    if let (Some(key_file), Some(cert_file)) = (&tls.key_file, &tls.cert_file) {
        warn!(
            key_file = %key_file.display(),
            cert_file = %cert_file.display(),
            "both a certificate and a PEM key file were given; using the PEM key file"
        );
    }
    tls.key_file.clone().or_else(|| tls.cert_file.clone())
}

/// Cursor failures pass through; undecodable documents are skipped
fn decode_item(item: mongodb::error::Result<Document>) -> Option<Result<LogEntry, StoreError>> {
    match item {
        Ok(doc) => match entry_from_document(&doc) {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                warn!(error = %err, "skipping malformed oplog entry");
                None
            }
        },
        Err(err) => Some(Err(cursor_error(err))),
    }
}

fn entry_from_document(doc: &Document) -> Result<LogEntry, StoreError> {
    let ts = doc
        .get_timestamp("ts")
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    let op = doc.get_str("op").unwrap_or_default();
    let namespace = doc.get_str("ns").unwrap_or_default();

    let mut entry = LogEntry::new(LogPosition::new(ts.time, ts.increment), op, namespace);
    entry.operation_id = doc.get("h").cloned().map(Bson::into_relaxed_extjson);
    entry.document = doc.get("o").cloned().map(Bson::into_relaxed_extjson);
    entry.criteria = doc.get("o2").cloned().map(Bson::into_relaxed_extjson);
    Ok(entry)
}
