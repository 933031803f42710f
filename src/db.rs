//! Document CRUD against Frappe's `/api/resource` REST surface.
//!
//! Every operation forwards its parameters verbatim and propagates failures
//! unchanged; retry policy is left to the host application.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::client::{parse_data_envelope, parse_message_envelope, ClientError, FrappeClient};

/// Query options for [`FrappeClient::get_list`].
///
/// Implements structural equality so the state layer can detect changed
/// inputs without reference identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListOptions {
    /// Field names to fetch; server default when unset.
    pub fields: Option<Vec<String>>,
    /// Frappe filter expression, eg `[["status", "=", "Open"]]`.
    pub filters: Option<Value>,
    /// Sort expression, eg `"modified desc"`.
    pub order_by: Option<String>,
    /// Pagination offset.
    pub limit_start: Option<u64>,
    /// Page length; server default when unset.
    pub limit: Option<u64>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit_start(mut self, limit_start: u64) -> Self {
        self.limit_start = Some(limit_start);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Renders the options as Frappe query parameters.
    ///
    /// `fields` and `filters` are JSON-encoded; `limit` maps to Frappe's
    /// `limit_page_length`.
    pub(crate) fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(fields) = &self.fields {
            query.push(("fields".to_string(), Value::from(fields.clone()).to_string()));
        }
        if let Some(filters) = &self.filters {
            query.push(("filters".to_string(), filters.to_string()));
        }
        if let Some(order_by) = &self.order_by {
            query.push(("order_by".to_string(), order_by.clone()));
        }
        if let Some(limit_start) = self.limit_start {
            query.push(("limit_start".to_string(), limit_start.to_string()));
        }
        if let Some(limit) = self.limit {
            query.push(("limit_page_length".to_string(), limit.to_string()));
        }
        query
    }
}

impl FrappeClient {
    /// Fetches a single document as `GET /api/resource/{doctype}/{name}`.
    pub async fn get_doc<T: DeserializeOwned>(
        &self,
        doctype: &str,
        name: &str,
    ) -> Result<T, ClientError> {
        let body = self.get_json(&doc_path(doctype, name), &[]).await?;
        parse_data_envelope(&body)
    }

    /// Fetches a list of documents as `GET /api/resource/{doctype}`.
    pub async fn get_list<T: DeserializeOwned>(
        &self,
        doctype: &str,
        options: &ListOptions,
    ) -> Result<Vec<T>, ClientError> {
        let body = self
            .get_json(&doctype_path(doctype), &options.to_query())
            .await?;
        parse_data_envelope(&body)
    }

    /// Creates a document and returns the server-returned version.
    pub async fn create_doc<T, B>(&self, doctype: &str, doc: &B) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = self.post_json(&doctype_path(doctype), doc).await?;
        parse_data_envelope(&body)
    }

    /// Applies a partial update and returns the updated document.
    pub async fn update_doc<T, B>(
        &self,
        doctype: &str,
        name: &str,
        patch: &B,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = self.put_json(&doc_path(doctype, name), patch).await?;
        parse_data_envelope(&body)
    }

    /// Deletes a document and returns the server acknowledgment.
    pub async fn delete_doc(&self, doctype: &str, name: &str) -> Result<String, ClientError> {
        let body = self.delete_json(&doc_path(doctype, name)).await?;
        parse_message_envelope(&body)
    }
}

fn doctype_path(doctype: &str) -> String {
    format!("/api/resource/{}", urlencoding::encode(doctype))
}

fn doc_path(doctype: &str, name: &str) -> String {
    format!(
        "/api/resource/{}/{}",
        urlencoding::encode(doctype),
        urlencoding::encode(name)
    )
}
