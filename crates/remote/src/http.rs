//! HTTP implementation of the remote API

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;

use esync_core::hash::ContentHash;

use crate::api::{ApiError, ChangesPage, CommitRequest, FileMeta, RemoteApi};

/// Remote API over HTTP with bearer-token authentication
pub struct HttpRemote {
    base_url: String,
    client: Client,
}

/// Body of a 409 response
#[derive(Deserialize)]
struct ConflictBody {
    current_version: u64,
    content_hash: ContentHash,
}

impl HttpRemote {
    /// Build a client for the given server.
    ///
    /// # Errors
    /// Returns an error if the underlying client cannot be constructed.
    pub fn new(
        server_url: &str,
        auth_token: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|e| ApiError::Protocol(e.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ApiError::Protocol(e.to_string()))?;

        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn file_url(&self, path: &str) -> String {
        format!("{}/files/{}", self.base_url, urlencoding::encode(path))
    }

    fn chunk_url(&self, hash: &ContentHash) -> String {
        format!("{}/chunks/{}", self.base_url, hash.to_hex())
    }

    /// Map a response to the classified error space; returns the response on
    /// success for the caller to read the body.
    fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(ApiError::Auth),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::GONE => Err(ApiError::Gone),
            StatusCode::CONFLICT => {
                let body: ConflictBody = response
                    .json()
                    .map_err(|e| ApiError::Protocol(format!("bad 409 body: {e}")))?;
                Err(ApiError::Conflict {
                    current_version: body.current_version,
                    content_hash: body.content_hash,
                })
            }
            s if s.is_server_error() => Err(ApiError::Server(s.as_u16())),
            s => Err(ApiError::Protocol(format!("unexpected status {s}"))),
        }
    }

    fn network(err: reqwest::Error) -> ApiError {
        ApiError::Network(err.to_string())
    }
}

impl RemoteApi for HttpRemote {
    fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn get_file(&self, path: &str) -> Result<FileMeta, ApiError> {
        let response = self
            .client
            .get(self.file_url(path))
            .send()
            .map_err(Self::network)?;
        Self::check(response)?
            .json()
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    fn list_files(&self) -> Result<Vec<FileMeta>, ApiError> {
        let response = self
            .client
            .get(format!("{}/files", self.base_url))
            .send()
            .map_err(Self::network)?;
        Self::check(response)?
            .json()
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    fn create_file(&self, req: &CommitRequest) -> Result<FileMeta, ApiError> {
        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .json(req)
            .send()
            .map_err(Self::network)?;
        Self::check(response)?
            .json()
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    fn update_file(&self, req: &CommitRequest) -> Result<FileMeta, ApiError> {
        let response = self
            .client
            .put(self.file_url(&req.path))
            .json(req)
            .send()
            .map_err(Self::network)?;
        Self::check(response)?
            .json()
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    fn delete_file(&self, path: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.file_url(path))
            .send()
            .map_err(Self::network)?;
        Self::check(response)?;
        Ok(())
    }

    fn changes_since(&self, cursor: Option<&str>) -> Result<ChangesPage, ApiError> {
        let mut request = self.client.get(format!("{}/changes", self.base_url));
        if let Some(cursor) = cursor {
            request = request.query(&[("since", cursor)]);
        }
        let response = request.send().map_err(Self::network)?;
        Self::check(response)?
            .json()
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    fn chunk_exists(&self, hash: &ContentHash) -> Result<bool, ApiError> {
        let response = self
            .client
            .head(self.chunk_url(hash))
            .send()
            .map_err(Self::network)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => {
                Self::check(response)?;
                Ok(true)
            }
        }
    }

    fn upload_chunk(&self, hash: &ContentHash, payload: &[u8]) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.chunk_url(hash))
            .body(payload.to_vec())
            .send()
            .map_err(Self::network)?;
        Self::check(response)?;
        Ok(())
    }

    fn download_chunk(&self, hash: &ContentHash) -> Result<Vec<u8>, ApiError> {
        let response = self
            .client
            .get(self.chunk_url(hash))
            .send()
            .map_err(Self::network)?;
        let bytes = Self::check(response)?
            .bytes()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
