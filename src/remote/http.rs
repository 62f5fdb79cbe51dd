//! JSON-over-HTTP implementations of the remote collaborators.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{
  ApiHistoryBody, ApiHistoryItem, ApiHistoryRemoveBody, ApiList, ApiListItem, ApiMembersBody,
  ApiShow,
};
use super::{
  ListHandle, ListMember, NewWatch, RemoteEntityService, RemoteListService, RemoteWatch,
  RemoteWatchService,
};
use crate::entity::Show;
use crate::error::RemoteError;

const API_VERSION: &str = "2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Page size for history requests. Only the first page is read.
const HISTORY_LIMIT: u32 = 1000;

/// HTTP client bound to one service base URL.
#[derive(Clone)]
pub struct HttpClient {
  client: Client,
  base: Url,
  client_id: Option<String>,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(
    base_url: &str,
    client_id: Option<String>,
    token: Option<String>,
  ) -> Result<Self, RemoteError> {
    // Url::join drops the last segment unless the base ends with '/'
    let base = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base = Url::parse(&base)
      .map_err(|e| RemoteError::Network(format!("bad base url '{}': {}", base_url, e)))?;

    let client = Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| RemoteError::Network(format!("failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      client_id,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
    let url = self
      .base
      .join(path)
      .map_err(|e| RemoteError::Network(format!("bad request path '{}': {}", path, e)))?;

    let mut builder = self
      .client
      .request(method, url)
      .header("trakt-api-version", API_VERSION);
    if let Some(client_id) = &self.client_id {
      builder = builder.header("trakt-api-key", client_id);
    }
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    Ok(builder)
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
    let response = send(self.request(Method::GET, path)?).await?;
    response
      .json()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }

  async fn post_json<B>(&self, path: &str, body: &B) -> Result<(), RemoteError>
  where
    B: Serialize + ?Sized,
  {
    send(self.request(Method::POST, path)?.json(body)).await?;
    Ok(())
  }
}

async fn send(builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
  let response = builder
    .send()
    .await
    .map_err(|e| RemoteError::Network(e.to_string()))?;

  let status = response.status();
  debug!(url = %response.url(), %status, "remote response");
  if status.is_success() {
    return Ok(response);
  }

  let url = response.url().to_string();
  let message = response.text().await.unwrap_or_default();
  Err(match status {
    StatusCode::UNAUTHORIZED => RemoteError::AuthRequired,
    StatusCode::NOT_FOUND => RemoteError::NotFound(url),
    _ => RemoteError::Status {
      status: status.as_u16(),
      message,
    },
  })
}

/// Show details from one service endpoint.
pub struct HttpShowSource {
  name: String,
  client: HttpClient,
}

impl HttpShowSource {
  pub fn new(client: HttpClient) -> Self {
    let name = client
      .base_url()
      .host_str()
      .unwrap_or("remote")
      .to_string();
    Self { name, client }
  }
}

#[async_trait]
impl RemoteEntityService<Show> for HttpShowSource {
  fn name(&self) -> &str {
    &self.name
  }

  async fn fetch(&self, key: &u64) -> Result<Show, RemoteError> {
    let show: ApiShow = self
      .client
      .get_json(&format!("shows/{}?extended=full", key))
      .await?;
    show
      .into_show()
      .ok_or_else(|| RemoteError::Decode(format!("show {} has no trakt id", key)))
  }
}

/// The user's followed list.
pub struct HttpListService {
  client: HttpClient,
  list: String,
}

impl HttpListService {
  pub fn new(client: HttpClient, list: impl Into<String>) -> Self {
    Self {
      client,
      list: list.into(),
    }
  }
}

#[async_trait]
impl RemoteListService for HttpListService {
  async fn list_handle(&self) -> Result<ListHandle, RemoteError> {
    let list: ApiList = self
      .client
      .get_json(&format!("users/me/lists/{}", self.list))
      .await?;
    list
      .ids
      .trakt
      .map(ListHandle)
      .ok_or_else(|| RemoteError::Decode(format!("list '{}' has no trakt id", self.list)))
  }

  async fn add_members(&self, handle: ListHandle, keys: &[u64]) -> Result<(), RemoteError> {
    self
      .client
      .post_json(
        &format!("users/me/lists/{}/items", handle),
        &ApiMembersBody::from_keys(keys),
      )
      .await
  }

  async fn remove_members(&self, handle: ListHandle, keys: &[u64]) -> Result<(), RemoteError> {
    self
      .client
      .post_json(
        &format!("users/me/lists/{}/items/remove", handle),
        &ApiMembersBody::from_keys(keys),
      )
      .await
  }

  async fn fetch_members(&self, handle: ListHandle) -> Result<Vec<ListMember>, RemoteError> {
    let items: Vec<ApiListItem> = self
      .client
      .get_json(&format!("users/me/lists/{}/items/shows", handle))
      .await?;
    Ok(items.into_iter().filter_map(ApiListItem::into_member).collect())
  }
}

/// The user's watch history.
pub struct HttpWatchService {
  client: HttpClient,
}

impl HttpWatchService {
  pub fn new(client: HttpClient) -> Self {
    Self { client }
  }
}

#[async_trait]
impl RemoteWatchService for HttpWatchService {
  async fn fetch_show_watches(&self, show: u64) -> Result<Vec<RemoteWatch>, RemoteError> {
    let items: Vec<ApiHistoryItem> = self
      .client
      .get_json(&format!("sync/history/shows/{}?limit={}", show, HISTORY_LIMIT))
      .await?;
    Ok(items.into_iter().filter_map(ApiHistoryItem::into_watch).collect())
  }

  async fn add_watches(&self, watches: &[NewWatch]) -> Result<(), RemoteError> {
    self
      .client
      .post_json("sync/history", &ApiHistoryBody::from_watches(watches))
      .await
  }

  async fn remove_watches(&self, history_ids: &[u64]) -> Result<(), RemoteError> {
    let body = ApiHistoryRemoveBody {
      ids: history_ids.to_vec(),
    };
    self.client.post_json("sync/history/remove", &body).await
  }
}
