//! HTTP client for a PostgREST-style backend (`/rest/v1/<table>`, `/rest/v1/rpc/<fn>`).

use async_trait::async_trait;
use reqwest::{header, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::{Filter, RemoteError, RemoteStore};
use crate::approval::{ApprovalBackend, EditRequest, PendingEdit};
use crate::resource::{reserialize, ResourceKind, Row};
use crate::session::Session;

/// Remote store and approval procedures over HTTP.
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
}

impl RestClient {
  pub fn new(base_url: &str, api_key: impl Into<String>, session: &Session) -> Result<Self, RemoteError> {
    let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
      .map_err(|e| RemoteError::Decode(format!("invalid base url {}: {}", base_url, e)))?;

    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| RemoteError::Transient(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      http,
      base,
      api_key: api_key.into(),
      access_token: session.access_token.clone(),
    })
  }

  fn table_url(&self, kind: ResourceKind, filters: &[Filter]) -> Result<Url, RemoteError> {
    let mut url = self
      .base
      .join(&format!("rest/v1/{}", kind.table()))
      .map_err(|e| RemoteError::Decode(e.to_string()))?;
    {
      let mut pairs = url.query_pairs_mut();
      for filter in filters {
        pairs.append_pair(&filter.column, &format!("eq.{}", filter.value));
      }
    }
    Ok(url)
  }

  fn rpc_url(&self, procedure: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("rest/v1/rpc/{}", procedure))
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }

  fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    builder
      .header("apikey", &self.api_key)
      .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
  }

  async fn send(&self, builder: RequestBuilder) -> Result<Value, RemoteError> {
    let response = self.authorize(builder).send().await.map_err(classify)?;
    let status = response.status();

    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::from_status(status.as_u16(), error_message(&body)));
    }

    if status == StatusCode::NO_CONTENT {
      return Ok(Value::Null);
    }

    let bytes = response.bytes().await.map_err(classify)?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
  }

  async fn call(&self, procedure: &str, args: Value) -> Result<Value, RemoteError> {
    debug!(procedure, "calling remote procedure");
    let url = self.rpc_url(procedure)?;
    self.send(self.http.post(url).json(&args)).await
  }
}

/// Map transport errors onto the remote failure taxonomy.
fn classify(err: reqwest::Error) -> RemoteError {
  if err.is_decode() {
    RemoteError::Decode(err.to_string())
  } else if let Some(status) = err.status() {
    RemoteError::from_status(status.as_u16(), err.to_string())
  } else {
    RemoteError::Transient(err.to_string())
  }
}

/// Pull `message` out of a JSON error body, falling back to the raw text.
fn error_message(body: &str) -> String {
  serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
    .unwrap_or_else(|| body.to_string())
}

fn into_rows(value: Value) -> Result<Vec<Row>, RemoteError> {
  match value {
    Value::Array(rows) => Ok(rows),
    Value::Null => Ok(Vec::new()),
    other => Ok(vec![other]),
  }
}

fn first_row(value: Value, what: &str) -> Result<Row, RemoteError> {
  into_rows(value)?
    .into_iter()
    .next()
    .ok_or_else(|| RemoteError::NotFound(what.to_string()))
}

#[async_trait]
impl RemoteStore for RestClient {
  async fn select(&self, kind: ResourceKind, filters: &[Filter]) -> Result<Vec<Row>, RemoteError> {
    let url = self.table_url(kind, filters)?;
    into_rows(self.send(self.http.get(url).query(&[("select", "*")])).await?)
  }

  async fn insert(&self, kind: ResourceKind, row: Row) -> Result<Row, RemoteError> {
    let url = self.table_url(kind, &[])?;
    let builder = self
      .http
      .post(url)
      .header("Prefer", "return=representation")
      .json(&row);
    first_row(self.send(builder).await?, kind.table())
  }

  async fn update(&self, kind: ResourceKind, id: &str, patch: Row) -> Result<Row, RemoteError> {
    let url = self.table_url(kind, &[Filter::eq("id", id)])?;
    let builder = self
      .http
      .patch(url)
      .header("Prefer", "return=representation")
      .json(&patch);
    first_row(self.send(builder).await?, &format!("{} {}", kind, id))
  }

  async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), RemoteError> {
    let url = self.table_url(kind, &[Filter::eq("id", id)])?;
    self.send(self.http.delete(url)).await?;
    Ok(())
  }
}

#[async_trait]
impl ApprovalBackend for RestClient {
  async fn request_edit(&self, request: &EditRequest) -> Result<String, RemoteError> {
    let args = serde_json::to_value(request).map_err(|e| RemoteError::Decode(e.to_string()))?;
    match self.call("request_edit", args).await? {
      Value::String(id) => Ok(id),
      other => Err(RemoteError::Decode(format!(
        "request_edit returned {} instead of an id",
        other
      ))),
    }
  }

  async fn approve_edit(&self, edit_id: &str) -> Result<(), RemoteError> {
    self.call("approve_edit", json!({ "p_edit_id": edit_id })).await?;
    Ok(())
  }

  async fn reject_edit(&self, edit_id: &str) -> Result<(), RemoteError> {
    self.call("reject_edit", json!({ "p_edit_id": edit_id })).await?;
    Ok(())
  }

  async fn pending_edits(
    &self,
    workspace_id: &str,
    approver_id: &str,
  ) -> Result<Vec<PendingEdit>, RemoteError> {
    let filters = [
      Filter::eq("workspace_id", workspace_id),
      Filter::eq("approver_id", approver_id),
      Filter::eq("status", "pending"),
    ];
    let url = self.table_url(ResourceKind::PendingEdits, &filters)?;
    let builder = self
      .http
      .get(url)
      .query(&[("select", "*"), ("order", "created_at.desc")]);
    let rows = into_rows(self.send(builder).await?)?;

    reserialize(rows).map_err(|e| RemoteError::Decode(e.to_string()))
  }

  async fn pending_edit(&self, edit_id: &str) -> Result<Option<PendingEdit>, RemoteError> {
    match self.get(ResourceKind::PendingEdits, edit_id).await? {
      Some(row) => reserialize(row)
        .map(Some)
        .map_err(|e| RemoteError::Decode(e.to_string())),
      None => Ok(None),
    }
  }
}
