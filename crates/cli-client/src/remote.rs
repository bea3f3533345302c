use async_trait::async_trait;
use client::error::{ClientError, Result};
use client::reconcile::{RemoteListApi, RemotePage};
use client::submit::{FileSpec, SubmissionApi, SubmissionOutcome};
use client::task::RemoteTask;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP adapter for the remote conversion service. Thin wire plumbing
/// only; all state handling lives in the client library.
pub struct HttpRemote {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct BatchFileEntry<'a> {
    local_id: &'a str,
    display_name: &'a str,
    bytes: u64,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    batch_id: &'a str,
    params: &'a serde_json::Value,
    files: Vec<BatchFileEntry<'a>>,
}

#[derive(Deserialize)]
struct BatchResultEntry {
    local_id: String,
    server_task_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<BatchResultEntry>,
}

#[derive(Deserialize)]
struct TaskListResponse {
    tasks: Vec<RemoteTask>,
    has_more: bool,
}

fn transport(e: reqwest::Error) -> ClientError {
    ClientError::Transport {
        message: e.to_string(),
    }
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl SubmissionApi for HttpRemote {
    async fn submit_batch(
        &self,
        batch_id: &str,
        files: &[(String, FileSpec)],
        params: &serde_json::Value,
    ) -> Result<Vec<SubmissionOutcome>> {
        let body = BatchRequest {
            batch_id,
            params,
            files: files
                .iter()
                .map(|(local_id, file)| BatchFileEntry {
                    local_id,
                    display_name: &file.display_name,
                    bytes: file.bytes,
                })
                .collect(),
        };

        let response: BatchResponse = self
            .http
            .post(format!("{}/v1/tasks:batch", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;

        Ok(response
            .results
            .into_iter()
            .map(|entry| SubmissionOutcome {
                local_id: entry.local_id,
                result: match (entry.server_task_id, entry.error) {
                    (Some(id), _) => Ok(id),
                    (None, Some(message)) => Err(message),
                    (None, None) => Err("server returned no task id".to_string()),
                },
            })
            .collect())
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        self.http
            .post(format!("{}/v1/tasks/{}/cancel", self.base_url, task_id))
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        Ok(())
    }
}

#[async_trait]
impl RemoteListApi for HttpRemote {
    async fn fetch_tasks(&self, page: u32) -> Result<RemotePage> {
        let response: TaskListResponse = self
            .http
            .get(format!("{}/v1/tasks", self.base_url))
            .query(&[("page", page)])
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;

        Ok(RemotePage {
            tasks: response.tasks,
            has_more: response.has_more,
        })
    }
}
