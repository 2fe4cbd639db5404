use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use indexhub_types::config::EngineArgs;
use indexhub_types::settings::EngineVersion;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};

use super::{BulkAction, BulkReport, SearchEngine, SnapshotStatus};
use crate::{Error, Result};

/// REST client for an Elasticsearch-compatible engine.
///
/// Transient failures (transport errors, 408/429/5xx answers) are retried
/// with exponential backoff up to the environment's `max_retries`; anything
/// else surfaces as [`Error::Engine`] with the response body.
#[derive(Debug)]
pub struct HttpSearchEngine {
    client: Client,
    base_url: String,
    max_retries: u32,
    retry_on_timeout: bool,
}

impl HttpSearchEngine {
    pub fn new(args: &EngineArgs) -> Result<HttpSearchEngine> {
        let host = args
            .hosts
            .first()
            .ok_or_else(|| Error::Config("engine args carry no hosts".to_owned()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(args.timeout_secs))
            .build()?;
        Ok(HttpSearchEngine {
            client,
            base_url: host.trim_end_matches('/').to_owned(),
            max_retries: args.max_retries,
            retry_on_timeout: args.retry_on_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Sends `build()` until it either succeeds, fails permanently, or
    /// exhausts the retry budget.
    async fn send<F, Fut>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Response, reqwest::Error>>,
    {
        let max_retries = self.max_retries;
        let retry_on_timeout = self.retry_on_timeout;
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let build = &build;
        backoff::future::retry(ExponentialBackoff::default(), move || {
            let request = build();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let out_of_budget = attempt > max_retries;
                match request.await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() || status == StatusCode::NOT_FOUND {
                            Ok(response)
                        } else if is_transient(status) && !out_of_budget {
                            Err(backoff::Error::transient(engine_error(response).await))
                        } else {
                            Err(backoff::Error::permanent(engine_error(response).await))
                        }
                    }
                    Err(err) if err.is_timeout() && !retry_on_timeout => {
                        Err(backoff::Error::permanent(Error::Http(err)))
                    }
                    Err(err) if out_of_budget => {
                        Err(backoff::Error::permanent(Error::Http(err)))
                    }
                    Err(err) => Err(backoff::Error::transient(Error::Http(err))),
                }
            }
        })
        .await
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self.send(|| self.request(Method::GET, path).send()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        Ok(response.json().await?)
    }
}

fn is_transient(status: StatusCode) -> bool {
    // Status codes that must trigger an automatic retry.
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

async fn engine_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Error::Engine { status, message }
}

#[async_trait]
impl SearchEngine for HttpSearchEngine {
    async fn version(&self) -> Result<EngineVersion> {
        let info = self.get_json("/").await?;
        let number = info["version"]["number"].as_str().unwrap_or("7.0.0");
        number
            .parse()
            .map_err(|_| Error::Config(format!("engine reports unparsable version `{number}`")))
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self.send(|| self.request(Method::HEAD, index).send()).await?;
        Ok(response.status().is_success())
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<Value> {
        let response = self
            .send(|| self.request(Method::PUT, index).json(body).send())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn delete_index(&self, index: &str) -> Result<Value> {
        let response = self
            .send(|| {
                self.request(Method::DELETE, index)
                    .query(&[("ignore_unavailable", "true")])
                    .send()
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // ignore-if-absent
            return Ok(json!({ "acknowledged": true }));
        }
        Ok(response.json().await?)
    }

    async fn list_indices(&self, pattern: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let listing = self.get_json(pattern).await?;
        let mut indices = BTreeMap::new();
        if let Value::Object(entries) = listing {
            for (name, body) in entries {
                let aliases = body["aliases"]
                    .as_object()
                    .map(|aliases| aliases.keys().cloned().collect())
                    .unwrap_or_default();
                indices.insert(name, aliases);
            }
        }
        Ok(indices)
    }

    async fn get_mapping(&self, index: &str) -> Result<Value> {
        self.get_json(&format!("{index}/_mapping")).await
    }

    async fn put_mapping_meta(&self, index: &str, meta: &Value) -> Result<Value> {
        let body = json!({ "_meta": meta });
        let response = self
            .send(|| self.request(Method::PUT, &format!("{index}/_mapping")).json(&body).send())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn get_documents(&self, index: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let body = json!({ "ids": ids });
        let response = self
            .send(|| self.request(Method::POST, &format!("{index}/_mget")).json(&body).send())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        let answer: Value = response.json().await?;
        let docs = answer["docs"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .map(|doc| {
                        if doc["found"].as_bool().unwrap_or(false) {
                            Some(doc["_source"].clone())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(docs)
    }

    async fn bulk(&self, index: &str, actions: &[BulkAction]) -> Result<BulkReport> {
        let mut payload = String::new();
        for action in actions {
            payload.push_str(
                &json!({ "index": { "_index": index, "_id": action.id } }).to_string(),
            );
            payload.push('\n');
            payload.push_str(&action.doc.to_string());
            payload.push('\n');
        }
        let response = self
            .send(|| {
                self.request(Method::POST, "_bulk")
                    .header("Content-Type", "application/x-ndjson")
                    .body(payload.clone())
                    .send()
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        let answer: Value = response.json().await?;
        let mut report = BulkReport::default();
        for item in answer["items"].as_array().into_iter().flatten() {
            let op = &item["index"];
            match op["error"].as_object() {
                Some(error) => report.errors.push((
                    op["_id"].as_str().unwrap_or_default().to_owned(),
                    Value::Object(error.clone()).to_string(),
                )),
                None => report.indexed += 1,
            }
        }
        Ok(report)
    }

    async fn get_repository(&self, repository: &str) -> Result<Option<Value>> {
        let response = self
            .send(|| self.request(Method::GET, &format!("_snapshot/{repository}")).send())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn create_repository(&self, repository: &str, body: &Value) -> Result<Value> {
        let response = self
            .send(|| {
                self.request(Method::PUT, &format!("_snapshot/{repository}")).json(body).send()
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str) -> Result<Value> {
        let response = self
            .send(|| {
                self.request(Method::PUT, &format!("_snapshot/{repository}/{snapshot}"))
                    .query(&[("wait_for_completion", "false")])
                    .send()
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(engine_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn snapshot_status(&self, repository: &str, snapshot: &str) -> Result<SnapshotStatus> {
        let status = self
            .get_json(&format!("_snapshot/{repository}/{snapshot}/_status"))
            .await?;
        let info = status["snapshots"]
            .as_array()
            .and_then(|snapshots| snapshots.first())
            .ok_or_else(|| Error::Engine {
                status: 200,
                message: format!(
                    "cannot find snapshot `{snapshot}` in repository `{repository}`"
                ),
            })?;
        let state = info["state"]
            .as_str()
            .and_then(|state| state.parse().ok())
            .ok_or_else(|| Error::Engine {
                status: 200,
                message: format!("cannot find a state in snapshot `{snapshot}`"),
            })?;
        let failed_shards = info["shards_stats"]["failed"].as_u64().unwrap_or(0);
        Ok(SnapshotStatus { state, failed_shards })
    }
}
