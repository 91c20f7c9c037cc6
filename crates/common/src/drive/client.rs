use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::types::{ChangeList, DriveFile, FileList, FileMetadata, FILE_FIELDS, FOLDER_MIME_TYPE};
use super::{ChangePage, RemoteChange, RemoteDrive, TokenSource};
use crate::error::{Error, Result};
use crate::object::Object;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Page size for file listings.
const LIST_PAGE_SIZE: u32 = 1000;

/// Authenticated Drive v3 client.
#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    api_base: String,
}

impl std::fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveClient")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl DriveClient {
    pub fn new(http: Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_api_base(http, tokens, DEFAULT_API_BASE)
    }

    pub fn with_api_base(http: Client, tokens: Arc<dyn TokenSource>, api_base: &str) -> Self {
        Self {
            http,
            tokens,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Underlying connection pool, shared with the downloader.
    pub fn http_client(&self) -> &Client {
        &self.http
    }

    pub fn token_source(&self) -> Arc<dyn TokenSource> {
        self.tokens.clone()
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let raw = response.bytes().await?;
            return Ok(serde_json::from_slice(&raw)?);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %body, "remote call failed");
        Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound(body),
            StatusCode::UNAUTHORIZED => Error::Auth(body),
            _ => Error::Protocol {
                status: status.as_u16(),
            },
        })
    }

    fn map_file(&self, file: DriveFile) -> Object {
        file.into_object(&self.api_base)
    }
}

#[async_trait::async_trait]
impl RemoteDrive for DriveClient {
    async fn get_object(&self, object_id: &str) -> Result<Object> {
        let request = self
            .request(Method::GET, &format!("files/{}", object_id))
            .await?
            .query(&[("fields", FILE_FIELDS)]);
        let file: DriveFile = self.call(request).await?;
        Ok(self.map_file(file))
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Object>> {
        let query = format!("'{}' in parents and trashed = false", parent_id);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let page_size = LIST_PAGE_SIZE.to_string();
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, "files").await?.query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let list: FileList = self.call(request).await?;
            objects.extend(list.files.into_iter().map(|f| self.map_file(f)));

            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn changes(&self, page_token: &str, page_size: u32) -> Result<ChangePage> {
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({}))",
            FILE_FIELDS
        );
        let page_size = page_size.to_string();
        let request = self.request(Method::GET, "changes").await?.query(&[
            ("pageToken", page_token),
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("includeRemoved", "true"),
        ]);
        let list: ChangeList = self.call(request).await?;

        let changes = list
            .changes
            .into_iter()
            .filter_map(|change| {
                let object_id = change
                    .file_id
                    .or_else(|| change.file.as_ref().map(|f| f.id.clone()))?;
                let explicitly_trashed =
                    change.file.as_ref().is_some_and(|f| f.explicitly_trashed);
                Some(RemoteChange {
                    object_id,
                    removed: change.removed,
                    explicitly_trashed,
                    object: change.file.map(|f| self.map_file(f)),
                })
            })
            .collect();

        Ok(ChangePage {
            changes,
            next_page_token: list.next_page_token,
            new_start_page_token: list.new_start_page_token,
        })
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Object> {
        let body = FileMetadata {
            name: Some(name.to_string()),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            parents: Some(vec![parent_id.to_string()]),
            ..Default::default()
        };
        let request = self
            .request(Method::POST, "files")
            .await?
            .query(&[("fields", FILE_FIELDS)])
            .json(&body);
        let file: DriveFile = self.call(request).await?;
        Ok(self.map_file(file))
    }

    async fn trash(&self, object_id: &str) -> Result<()> {
        let body = FileMetadata {
            trashed: Some(true),
            ..Default::default()
        };
        let request = self
            .request(Method::PATCH, &format!("files/{}", object_id))
            .await?
            .query(&[("fields", "id")])
            .json(&body);
        let _: serde_json::Value = self.call(request).await?;
        Ok(())
    }

    async fn remove_parent(&self, object_id: &str, parent_id: &str) -> Result<Object> {
        let request = self
            .request(Method::PATCH, &format!("files/{}", object_id))
            .await?
            .query(&[("removeParents", parent_id), ("fields", FILE_FIELDS)])
            .json(&FileMetadata::default());
        let file: DriveFile = self.call(request).await?;
        Ok(self.map_file(file))
    }

    async fn move_object(
        &self,
        object_id: &str,
        old_parent: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<Object> {
        let body = FileMetadata {
            name: Some(new_name.to_string()),
            ..Default::default()
        };
        let mut request = self
            .request(Method::PATCH, &format!("files/{}", object_id))
            .await?
            .query(&[("fields", FILE_FIELDS)]);
        if old_parent != new_parent {
            request = request.query(&[("addParents", new_parent), ("removeParents", old_parent)]);
        }
        let file: DriveFile = self.call(request.json(&body)).await?;
        Ok(self.map_file(file))
    }
}
