use crate::backend::{BackendError, PushItem, PushOutcome, RemoteBackend};
use crate::config::ObjectStoreConfig;
use crate::models::{SourceRow, Task, TaskId};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many object names one listing call returns; fetch pages until a
/// short page comes back.
const LIST_PAGE_SIZE: usize = 100;

/// Object-storage backend: one JSON document per task under
/// `{prefix}/{id}.json`. `SourceRow` for this backend is the object key.
///
/// The per-task layout (rather than one blob for the whole set) is what
/// lets two processes conflict on exactly the task they both touched.
pub struct ObjectStoreBackend {
    client: Client,
    base_url: String,
    bucket: String,
    prefix: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
}

#[derive(Deserialize)]
struct ObjectEntry {
    name: String,
}

impl ObjectStoreBackend {
    pub fn new(config: &ObjectStoreConfig, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
        }
    }

    fn object_key(&self, id: TaskId) -> String {
        if self.prefix.is_empty() {
            format!("{id}.json")
        } else {
            format!("{}/{id}.json", self.prefix)
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, self.bucket, key)
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
    }

    fn check_status(
        resp: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackendError::Auth(format!("HTTP {status}")));
        }
        Err(BackendError::Unavailable(format!("HTTP {status}")))
    }

    fn list_keys(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/object/list/{}", self.base_url, self.bucket);
        let mut keys = Vec::new();
        let mut offset = 0usize;
        loop {
            let resp = self
                .authed(self.client.post(&url))
                .json(&ListRequest {
                    prefix: &self.prefix,
                    limit: LIST_PAGE_SIZE,
                    offset,
                })
                .send()
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            let page: Vec<ObjectEntry> = Self::check_status(resp)?
                .json()
                .map_err(|e| BackendError::Malformed(e.to_string()))?;
            let count = page.len();
            for entry in page {
                if entry.name.ends_with(".json") {
                    keys.push(self.qualify(&entry.name));
                }
            }
            if count < LIST_PAGE_SIZE {
                return Ok(keys);
            }
            offset += count;
        }
    }

    // Listing returns names relative to the prefix.
    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() || name.starts_with(&self.prefix) {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    /// `Ok(None)` when the object does not exist.
    fn get_object(&self, key: &str) -> Result<Option<Task>, BackendError> {
        let resp = self
            .authed(self.client.get(self.object_url(key)))
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut task: Task = Self::check_status(resp)?
            .json()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        task.source_row = Some(SourceRow(key.to_string()));
        Ok(Some(task))
    }

    fn put_object(&self, key: &str, task: &Task) -> Result<(), BackendError> {
        // The stored document never carries a source row; the key is the
        // locator.
        let mut doc = task.clone();
        doc.source_row = None;
        let resp = self
            .authed(self.client.post(self.object_url(key)))
            .header("x-upsert", "true")
            .json(&doc)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check_status(resp)?;
        Ok(())
    }
}

impl RemoteBackend for ObjectStoreBackend {
    fn describe(&self) -> String {
        format!("object:{}/{}", self.bucket, self.prefix)
    }

    fn fetch_all(&self) -> Result<Vec<Task>, BackendError> {
        let keys = self.list_keys()?;
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_object(&key) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {} // deleted between list and get
                Err(BackendError::Malformed(reason)) => {
                    tracing::warn!("skipping object {key}: {reason}");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(tasks)
    }

    fn push(&self, batch: &[PushItem]) -> Result<PushOutcome, BackendError> {
        let mut outcome = PushOutcome::default();
        for item in batch {
            let key = match &item.task.source_row {
                Some(row) => row.as_str().to_string(),
                None => self.object_key(item.task.id),
            };

            if let Some(base) = item.base_revision {
                // Re-read before overwriting so a concurrent writer turns
                // into a conflict for this task only.
                let current = self.get_object(&key)?;
                let stale = match current {
                    Some(remote) => remote.revision != base || remote.id != item.task.id,
                    None => true,
                };
                if stale {
                    outcome.conflicts.push(item.task.id);
                    continue;
                }
            }

            self.put_object(&key, &item.task)?;
            outcome.written.push((item.task.id, SourceRow(key)));
        }
        Ok(outcome)
    }

    fn delete(&self, id: TaskId, source_row: &SourceRow) -> Result<(), BackendError> {
        let resp = self
            .authed(self.client.delete(self.object_url(source_row.as_str())))
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(id));
        }
        Self::check_status(resp)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectStoreConfig;

    fn backend() -> ObjectStoreBackend {
        ObjectStoreBackend::new(
            &ObjectStoreConfig {
                endpoint: "https://storage.example.com/".to_string(),
                bucket: "terminal-to-do".to_string(),
                prefix: "/tasks/".to_string(),
                api_key: "secret".to_string(),
            },
            Duration::from_secs(10),
        )
    }

    #[test]
    fn endpoint_and_prefix_are_normalized() {
        let backend = backend();
        assert_eq!(backend.base_url, "https://storage.example.com");
        assert_eq!(backend.prefix, "tasks");
    }

    #[test]
    fn object_keys_live_under_the_prefix() {
        let backend = backend();
        let id = TaskId::new();
        assert_eq!(backend.object_key(id), format!("tasks/{id}.json"));
        assert_eq!(
            backend.object_url(&backend.object_key(id)),
            format!("https://storage.example.com/object/terminal-to-do/tasks/{id}.json")
        );
    }

    #[test]
    fn listing_names_are_qualified_once() {
        let backend = backend();
        assert_eq!(backend.qualify("abc.json"), "tasks/abc.json");
        assert_eq!(backend.qualify("tasks/abc.json"), "tasks/abc.json");
    }
}
