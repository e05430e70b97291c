use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::RemoteSource;
use crate::criteria::Criteria;
use crate::types::{Location, Row};

/// HTTP client for the data API.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  protocol: String,
}

/// Storage responses come back either bare or wrapped in `objects`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowsResponse {
  Wrapped { objects: Vec<Row> },
  Bare(Vec<Row>),
}

impl RowsResponse {
  fn into_rows(self) -> Vec<Row> {
    match self {
      RowsResponse::Wrapped { objects } => objects,
      RowsResponse::Bare(rows) => rows,
    }
  }
}

impl HttpRemote {
  pub fn new(protocol: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("trambar-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      protocol: protocol.to_string(),
    })
  }

  fn endpoint(&self, server: &str, path: &str) -> Result<Url> {
    let base = format!("{}://{}/", self.protocol, server);
    Url::parse(&base)
      .and_then(|url| url.join(path))
      .map_err(|e| eyre!("Invalid server address {}: {}", server, e))
  }

  async fn post_rows(&self, url: Url, body: Value) -> Result<Vec<Row>> {
    let response = self
      .client
      .post(url.clone())
      .json(&body)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let rows: RowsResponse = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))?;

    Ok(rows.into_rows())
  }

  async fn store(&self, location: &Location, objects: Vec<Row>) -> Result<Vec<Row>> {
    let url = self.endpoint(
      &location.server,
      &format!("srv/data/storage/{}/{}/", location.schema, location.table),
    )?;
    self.post_rows(url, json!({ "objects": objects })).await
  }
}

impl RemoteSource for HttpRemote {
  async fn fetch(&self, location: &Location, criteria: &Criteria) -> Result<Vec<Row>> {
    let url = self.endpoint(
      &location.server,
      &format!("srv/data/retrieval/{}/{}/", location.schema, location.table),
    )?;
    self.post_rows(url, json!({ "criteria": criteria })).await
  }

  async fn save(&self, location: &Location, objects: &[Row]) -> Result<Vec<Row>> {
    self.store(location, objects.to_vec()).await
  }

  async fn remove(&self, location: &Location, objects: &[Row]) -> Result<Vec<Row>> {
    let flagged = objects
      .iter()
      .map(|object| {
        let mut object = object.clone();
        object.insert("deleted".to_string(), Value::Bool(true));
        object
      })
      .collect();
    self.store(location, flagged).await
  }

  async fn subscribe(&self, server: &str, token: &str) -> Result<()> {
    let url = self.endpoint(server, "srv/data/subscription/")?;
    self
      .client
      .post(url.clone())
      .json(&json!({ "token": token }))
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Subscription at {} rejected: {}", url, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_urls() {
    let remote = HttpRemote::new("https").unwrap();
    let url = remote
      .endpoint("trambar.example.net", "srv/data/retrieval/global/user/")
      .unwrap();
    assert_eq!(
      url.as_str(),
      "https://trambar.example.net/srv/data/retrieval/global/user/"
    );
  }

  #[test]
  fn test_invalid_server_is_an_error() {
    let remote = HttpRemote::new("https").unwrap();
    assert!(remote.endpoint("bad host name", "srv/").is_err());
  }

  #[test]
  fn test_rows_response_shapes() {
    let wrapped: RowsResponse = serde_json::from_str(r#"{"objects":[{"id":1}]}"#).unwrap();
    assert_eq!(wrapped.into_rows().len(), 1);
    let bare: RowsResponse = serde_json::from_str(r#"[{"id":1},{"id":2}]"#).unwrap();
    assert_eq!(bare.into_rows().len(), 2);
  }
}
