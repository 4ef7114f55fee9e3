use serde_json::Value;

use oplogtail_types::LogPosition;

/// Where tailing begins
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Since {
    /// Entries written from now on
    #[default]
    Now,
    /// Entries strictly after this position
    Position(LogPosition),
    /// Entries after the newest matching entry at first start
    LastEntry,
}

/// Configuration of an oplog tail
#[derive(Clone, Debug, Default)]
pub struct TailOptions {
    /// Namespace pattern (`db.coll`, `*.coll`, `db.*`). `None` tails everything.
    pub namespace: Option<String>,

    /// Deliver presentation-shaped payloads instead of raw entries
    pub pretty: bool,

    /// Starting point of the first stream
    pub since: Since,

    /// Oplog collection name, defaults to `oplog.rs`
    pub collection: Option<String>,

    /// Raw query document; replaces the namespace condition in the query
    pub filter: Option<Value>,
}

impl TailOptions {
    pub fn namespace(mut self, pattern: impl Into<String>) -> Self {
        self.namespace = Some(pattern.into());
        self
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }
}
