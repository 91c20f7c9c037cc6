//! Drive v3 JSON payloads and their mapping onto [`Object`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::{escape_name, Object};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Field mask requested for every file resource.
pub const FILE_FIELDS: &str =
    "id,name,mimeType,size,modifiedTime,parents,trashed,explicitlyTrashed,capabilities(canTrash)";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub can_trash: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Decimal string; absent for folders and native documents
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub explicitly_trashed: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Map onto an object record; `api_base` anchors the download URL.
    pub fn into_object(self, api_base: &str) -> Object {
        let is_dir = self.is_folder();
        let size = if is_dir {
            0
        } else {
            self.size
                .as_deref()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Object {
            download_url: download_url(api_base, &self.id),
            name: escape_name(&self.name),
            is_dir,
            size,
            last_modified: self.modified_time.unwrap_or_else(Utc::now),
            parents: self.parents,
            can_trash: self.capabilities.can_trash,
            object_id: self.id,
        }
    }
}

/// Download URL derivable from the object id alone.
pub fn download_url(api_base: &str, object_id: &str) -> String {
    format!("{}/files/{}?alt=media", api_base.trim_end_matches('/'), object_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveChange {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub new_start_page_token: Option<String>,
    #[serde(default)]
    pub changes: Vec<DriveChange>,
}

/// Body for folder creation and metadata patches.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.googleapis.com/drive/v3";

    #[test]
    fn test_file_maps_to_object() {
        let raw = r#"{
            "id": "abc",
            "name": "clip.mp4",
            "mimeType": "video/mp4",
            "size": "10485760",
            "modifiedTime": "2024-01-02T03:04:05.000Z",
            "parents": ["root-id"],
            "capabilities": {"canTrash": true}
        }"#;
        let file: DriveFile = serde_json::from_str(raw).unwrap();
        let obj = file.into_object(BASE);
        assert_eq!(obj.object_id, "abc");
        assert_eq!(obj.size, 10_485_760);
        assert!(!obj.is_dir);
        assert!(obj.can_trash);
        assert_eq!(obj.parents, vec!["root-id".to_string()]);
        assert_eq!(
            obj.download_url,
            "https://www.googleapis.com/drive/v3/files/abc?alt=media"
        );
    }

    #[test]
    fn test_folder_has_zero_size_and_escaped_name() {
        let raw = r#"{
            "id": "dir",
            "name": "AC/DC",
            "mimeType": "application/vnd.google-apps.folder",
            "size": "99"
        }"#;
        let file: DriveFile = serde_json::from_str(raw).unwrap();
        let obj = file.into_object(BASE);
        assert!(obj.is_dir);
        assert_eq!(obj.size, 0);
        assert!(!obj.name.contains('/'));
        assert!(!obj.can_trash);
    }

    #[test]
    fn test_change_list_parses_removed_entries() {
        let raw = r#"{
            "newStartPageToken": "42",
            "changes": [
                {"fileId": "gone", "removed": true},
                {"fileId": "kept", "removed": false, "file": {"id": "kept", "name": "a", "explicitlyTrashed": true}}
            ]
        }"#;
        let list: ChangeList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.new_start_page_token.as_deref(), Some("42"));
        assert!(list.changes[0].removed);
        assert!(list.changes[1].file.as_ref().unwrap().explicitly_trashed);
    }
}
