//! Extension hooks for the serve loop.
//!
//! A small, fixed surface: `on_header` fires for every proxied message,
//! `on_query` fires when a query document has been parsed. The only shipped
//! extension logs queries.

use bson::Document;
use mongobridge_protocol::MsgHeader;

/// Observes messages as they pass through a proxy.
pub trait ProxyExtension: Send + Sync {
    /// Called with every message header read from a client.
    fn on_header(&self, _header: &MsgHeader) {}

    /// Called when a query document has been parsed for interception.
    fn on_query(&self, _collection: &[u8], _query: &Document) {}
}

/// An ordered list of extensions invoked at fixed points.
pub struct ExtensionStack {
    extensions: Vec<Box<dyn ProxyExtension>>,
}

impl ExtensionStack {
    pub fn new(extensions: Vec<Box<dyn ProxyExtension>>) -> Self {
        Self { extensions }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn on_header(&self, header: &MsgHeader) {
        for extension in &self.extensions {
            extension.on_header(header);
        }
    }

    pub fn on_query(&self, collection: &[u8], query: &Document) {
        for extension in &self.extensions {
            extension.on_query(collection, query);
        }
    }
}

/// Logs every parsed query.
pub struct QueryLogger;

impl ProxyExtension for QueryLogger {
    fn on_header(&self, header: &MsgHeader) {
        tracing::debug!(op = %header.op_code, len = header.message_length, "message");
    }

    fn on_query(&self, collection: &[u8], query: &Document) {
        // Strip the NUL terminator for display.
        let name = collection.split_last().map(|(_, n)| n).unwrap_or(collection);
        tracing::info!(
            collection = %String::from_utf8_lossy(name),
            query = %query,
            "query"
        );
    }
}
