//! Remote file records and change-feed entries
//!
//! Wire format follows the Drive v3 REST shapes: camelCase field names,
//! `size` arriving as a JSON string. A record with no `size` is not a
//! downloadable blob (folders, shortcuts, native docs).

use serde::{Deserialize, Deserializer, Serialize};

/// Substring marking a folder mime type
const FOLDER_MIME_MARKER: &str = "folder";

/// Mime type assigned to folders the engine creates
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// The authoritative remote record. Replaced wholesale on every change;
/// never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub mime_type: String,

    /// Absent for folders and for records with no downloadable content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_checksum: Option<String>,

    /// The service encodes sizes as strings on the wire
    #[serde(
        default,
        deserialize_with = "de_opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u64>,

    /// ISO-8601 timestamp with fixed offset; compared as a string, never
    /// parsed to an instant
    #[serde(default)]
    pub modified_time: String,

    /// Multi-parent DAG: one record may sit under several folders
    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(default)]
    pub trashed: bool,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.mime_type.contains(FOLDER_MIME_MARKER)
    }

    /// A record without a size has no content to transfer
    pub fn is_downloadable(&self) -> bool {
        !self.is_folder() && self.size.is_some()
    }
}

/// One entry from the incremental change feed: either a fresh record or a
/// removal marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde(default)]
    pub file_id: String,

    #[serde(default)]
    pub removed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
}

impl Change {
    /// True when the change must be applied as a local removal
    pub fn is_removal(&self) -> bool {
        self.removed || self.file.as_ref().map(|f| f.trashed).unwrap_or(false)
    }
}

/// One page of the change feed
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub new_start_page_token: Option<String>,
}

/// One page of a children listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Metadata sent when creating a record or patching one
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
}

fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    let value = Option::<StringOrNumber>::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(StringOrNumber::Number(n)) => Ok(Some(n)),
        Some(StringOrNumber::String(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_wire_record_with_string_size() {
        let json = r#"{
            "id": "f1",
            "name": "a.txt",
            "mimeType": "text/plain",
            "md5Checksum": "h1",
            "size": "3",
            "modifiedTime": "2024-05-01T10:00:00.000Z",
            "parents": ["folder-1"],
            "trashed": false
        }"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.size, Some(3));
        assert_eq!(record.md5_checksum.as_deref(), Some("h1"));
        assert!(!record.is_folder());
        assert!(record.is_downloadable());
    }

    #[test]
    fn folder_has_no_content() {
        let json = r#"{
            "id": "d1",
            "name": "F",
            "mimeType": "application/vnd.google-apps.folder",
            "modifiedTime": "2024-05-01T10:00:00.000Z",
            "parents": ["root-1"]
        }"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_folder());
        assert!(!record.is_downloadable());
        assert_eq!(record.size, None);
    }

    #[test]
    fn trashed_change_counts_as_removal() {
        let record: FileRecord = serde_json::from_str(
            r#"{"id":"f1","name":"a","mimeType":"text/plain","trashed":true}"#,
        )
        .unwrap();
        let change = Change {
            file_id: "f1".into(),
            removed: false,
            file: Some(record),
        };
        assert!(change.is_removal());

        let bare = Change {
            file_id: "f2".into(),
            removed: true,
            file: None,
        };
        assert!(bare.is_removal());
    }
}
