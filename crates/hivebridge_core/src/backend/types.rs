//! Value types exchanged with backing collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options used to create one backing client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Application instance DID document (JSON) used during authentication.
    #[serde(rename = "authenticationDIDDocument")]
    pub authentication_did_document: String,
}

/// Remote file or folder kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Folder,
}

impl FileKind {
    /// Caller wire value (`0` file, `1` folder).
    pub fn wire_value(self) -> u8 {
        match self {
            Self::File => 0,
            Self::Folder => 1,
        }
    }
}

impl Serialize for FileKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.wire_value())
    }
}

/// Metadata for one remote file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Last modification time in epoch milliseconds.
    pub last_modified: i64,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

/// Query shaping options for find calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    /// Sort order as `{field: 1 | -1}`.
    pub sort: Option<Value>,
    pub projection: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    pub inserted_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    pub inserted_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub upserted_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[cfg(test)]
mod tests {
    use super::{ClientOptions, FileInfo, FileKind};
    use serde_json::json;

    #[test]
    fn client_options_read_the_caller_key() {
        let options: ClientOptions = serde_json::from_value(json!({
            "authenticationDIDDocument": "{\"id\":\"did:elastos:app\"}"
        }))
        .expect("caller shape");
        assert_eq!(options.authentication_did_document, r#"{"id":"did:elastos:app"}"#);

        let wrong_case = serde_json::from_value::<ClientOptions>(json!({
            "authenticationDidDocument": "{}"
        }));
        assert!(wrong_case.is_err());
    }

    #[test]
    fn file_info_uses_wire_kind() {
        let info = FileInfo {
            name: "a.txt".to_string(),
            size: 3,
            last_modified: 10,
            kind: FileKind::Folder,
        };
        let value = serde_json::to_value(&info).expect("serialize");
        assert_eq!(value["type"], 1);
        assert_eq!(value["lastModified"], 10);
    }
}
