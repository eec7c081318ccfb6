//! Blocking HTTP client for the record service.

use crate::api::{RecordApi, SaveOutcome};
use crate::bus::{BusMessage, DropReason, SubscriptionId, Topic};
use crate::client::listener::EventSource;
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::http::{
    DataResponse, ErrorBody, ErrorCode, ExistsResponse, PermissionsResponse, PollResponse,
    SaveAllBody, SaveResponse, StatusResponse, SubscribeBody, SubscribeResponse,
};
use crate::types::{Actor, ClientId, MergeRegion, Permission, Record, Table, TableRow};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

/// Why a request failed, keeping the server's error code when there was one.
enum Failure {
    Server(StatusCode, ErrorBody),
    Other(SyncError),
}

impl From<Failure> for SyncError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Server(_, body) => body.into_sync_error(),
            Failure::Other(err) => err,
        }
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL of `/<prefix>/<key>` with `key` percent-encoded as one segment.
    fn keyed_url(&self, prefix: &str, key: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SyncError::Config(format!("server_url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("server_url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push(prefix)
            .push(key);
        Ok(url)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> std::result::Result<T, Failure> {
        let response = request.send().map_err(|e| Failure::Other(e.into()))?;
        let status = response.status();
        let bytes = response.bytes().map_err(|e| Failure::Other(e.into()))?;

        if status.is_success() {
            return serde_json::from_slice(&bytes)
                .map_err(|e| Failure::Other(SyncError::Deserialization(e.to_string())));
        }
        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(Failure::Server(status, body)),
            Err(_) => Err(Failure::Other(SyncError::Network(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )))),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: impl reqwest::IntoUrl) -> Result<T> {
        Ok(self.send(self.client.get(url))?)
    }

    fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        Ok(self.send(self.client.post(self.url(path)).json(body))?)
    }

    pub fn health(&self) -> Result<()> {
        let _: serde_json::Value = self.get_json(self.url("/health"))?;
        Ok(())
    }

    /// Records matching a search filter, evaluated on the server.
    pub fn search(&self, query: &str) -> Result<Vec<Record>> {
        Ok(self.send(self.client.get(self.url("/rn_records")).query(&[("q", query)]))?)
    }

    pub fn get_table_rows(&self, table_name: &str) -> Result<Vec<TableRow>> {
        let response: DataResponse<Vec<TableRow>> =
            self.post_json("/get_table", &json!({ "table_name": table_name }))?;
        Ok(response.data)
    }

    pub fn save_table_rows(&self, table_name: &str, rows: &[TableRow]) -> Result<()> {
        let _: StatusResponse =
            self.post_json("/save_table", &json!({ "table_name": table_name, "data": rows }))?;
        Ok(())
    }

    pub fn get_merged_cells(&self, table_name: &str) -> Result<Vec<MergeRegion>> {
        let response: DataResponse<Vec<MergeRegion>> =
            self.post_json("/get_merged_cells", &json!({ "table_name": table_name }))?;
        Ok(response.data)
    }

    pub fn save_merged_cells(&self, table_name: &str, regions: &[MergeRegion]) -> Result<()> {
        let _: StatusResponse = self.post_json(
            "/save_merged_cells",
            &json!({ "table_name": table_name, "merged_cells": regions }),
        )?;
        Ok(())
    }

    /// Open a server-side subscription on `channels`, skipping messages
    /// caused by `exclude`.
    pub fn subscribe(&self, channels: &[Topic], exclude: Option<ClientId>) -> Result<RemoteSubscription> {
        let body = SubscribeBody {
            channels: channels.to_vec(),
            client_id: exclude.map(|id| id.to_string()),
        };
        let response: SubscribeResponse = self.post_json("/subscriptions", &body)?;
        tracing::debug!(subscription = response.subscription_id.0, "remote subscription opened");
        Ok(RemoteSubscription {
            client: self.clone(),
            body,
            id: Some(response.subscription_id),
        })
    }
}

impl RecordApi for HttpClient {
    fn exists(&self, issue_number: &str) -> Result<bool> {
        let response: ExistsResponse =
            self.get_json(self.keyed_url("rn_record_exists", issue_number)?)?;
        Ok(response.exists)
    }

    fn get(&self, issue_number: &str) -> Result<Record> {
        self.get_json(self.keyed_url("rn_record", issue_number)?)
    }

    fn list(&self) -> Result<Vec<Record>> {
        self.get_json(self.url("/rn_records"))
    }

    fn save(&self, actor: &Actor, record: Record, old_key: Option<&str>) -> Result<SaveOutcome> {
        let mut body = record
            .with("client_id", actor.client_id.to_string())
            .with("username", actor.username.as_str());
        if let Some(old) = old_key {
            body.set("old_issue_number", old);
        }
        let response: SaveResponse = self.post_json("/rn_record", &body)?;
        Ok(response.outcome)
    }

    fn delete(&self, actor: &Actor, issue_number: &str) -> Result<()> {
        let client_id = actor.client_id.to_string();
        let request = self
            .client
            .delete(self.keyed_url("rn_record", issue_number)?)
            .query(&[
                ("client_id", client_id.as_str()),
                ("username", actor.username.as_str()),
            ]);
        let _: StatusResponse = self.send(request)?;
        Ok(())
    }

    fn permissions(&self, username: &str) -> Result<Permission> {
        let request = self
            .client
            .get(self.url("/get_permissions"))
            .query(&[("username", username)]);
        let response: PermissionsResponse = self.send(request)?;
        Ok(Permission(response.permissions))
    }

    fn get_table(&self, table_name: &str) -> Result<Table> {
        let response: DataResponse<Table> =
            self.post_json("/get_all", &json!({ "table_name": table_name }))?;
        Ok(response.data)
    }

    fn save_all(&self, actor: &Actor, table_name: &str, table: &Table) -> Result<()> {
        let body = SaveAllBody {
            table_name: table_name.to_string(),
            data: table.rows.clone(),
            merged_cells: table.merged_cells.clone(),
            client_id: Some(actor.client_id.to_string()),
        };
        let _: StatusResponse = self.post_json("/save_all", &body)?;
        Ok(())
    }
}

/// A subscription held open on the server and drained by long-polling.
///
/// If the server forgets the subscription (idle reaping, restart) the poll
/// yields a `Dropped` notice and the next poll opens a fresh one. Messages
/// published in between are lost; the notice tells the cache to resync.
pub struct RemoteSubscription {
    client: HttpClient,
    body: SubscribeBody,
    id: Option<SubscriptionId>,
}

impl RemoteSubscription {
    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    fn reopen(&mut self) -> Result<SubscriptionId> {
        let response: SubscribeResponse = self.client.post_json("/subscriptions", &self.body)?;
        tracing::warn!(
            subscription = response.subscription_id.0,
            "remote subscription reopened"
        );
        self.id = Some(response.subscription_id);
        Ok(response.subscription_id)
    }

    /// Delete the server-side subscription.
    pub fn unsubscribe(&mut self) -> Result<()> {
        if let Some(id) = self.id.take() {
            let url = self.client.url(&format!("/subscriptions/{}", id));
            let _: StatusResponse = self.client.send(self.client.client.delete(url))?;
        }
        Ok(())
    }
}

impl EventSource for RemoteSubscription {
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<BusMessage>> {
        let id = match self.id {
            Some(id) => id,
            None => self.reopen()?,
        };

        let url = self.client.url(&format!("/subscriptions/{}/poll", id));
        let timeout_ms = timeout.as_millis().to_string();
        let request = self
            .client
            .client
            .get(url)
            .query(&[("timeout_ms", timeout_ms.as_str())])
            .timeout(self.client.request_timeout + timeout);

        match self.client.send::<PollResponse>(request) {
            Ok(response) => Ok(response.messages),
            Err(Failure::Server(status, body))
                if status == StatusCode::NOT_FOUND
                    && body.code == ErrorCode::SubscriptionNotFound =>
            {
                self.id = None;
                Ok(vec![BusMessage::Dropped {
                    reason: DropReason::IdleTimeout,
                }])
            }
            Err(failure) => Err(failure.into()),
        }
    }

    fn close(&mut self) {
        if let Err(err) = self.unsubscribe() {
            tracing::warn!(error = %err, "failed to close remote subscription");
        }
    }
}
