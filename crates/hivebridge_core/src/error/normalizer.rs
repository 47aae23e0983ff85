//! Backing failure classification.
//!
//! Classification is ordered: failure kind first, message text second, and
//! the catch-all `Unspecified` last. Message sniffing couples us to the
//! backing service wording and is best-effort only.

use super::{BackendError, BackendErrorKind, ErrorCode, StructuredError};

/// Message replied for `VaultNotFound`; the backing text is not useful to callers.
pub const VAULT_NOT_FOUND_MESSAGE: &str =
    "Vault does not exist. It has to be created by calling createVault()";

const COLLECTION_NOT_FOUND_TEXT: &str = "collection not exist";
const ITEM_NOT_FOUND_TEXT: &str = "Item not found";

/// Converts one backing failure into a caller-facing structured error.
///
/// Deterministic and infallible. Unclassified failures keep their message
/// verbatim.
pub fn normalize(failure: &BackendError) -> StructuredError {
    if let Some(code) = classify_kind(failure.kind) {
        let message = match code {
            ErrorCode::VaultNotFound => VAULT_NOT_FOUND_MESSAGE.to_string(),
            _ => failure.message.clone(),
        };
        return StructuredError::new(code, message);
    }

    if let Some(code) = classify_message(&failure.message) {
        return StructuredError::new(code, failure.message.clone());
    }

    StructuredError::new(ErrorCode::Unspecified, failure.message.clone())
}

fn classify_kind(kind: BackendErrorKind) -> Option<ErrorCode> {
    match kind {
        BackendErrorKind::VaultNotFound => Some(ErrorCode::VaultNotFound),
        BackendErrorKind::ProviderNotPublished => Some(ErrorCode::ProviderNotPublished),
        BackendErrorKind::DidNotPublished => Some(ErrorCode::DidNotPublished),
        BackendErrorKind::FileNotFound => Some(ErrorCode::FileNotFound),
        BackendErrorKind::VaultAlreadyExists
        | BackendErrorKind::ProviderNotSet
        | BackendErrorKind::Io
        | BackendErrorKind::Auth
        | BackendErrorKind::Other => None,
    }
}

fn classify_message(message: &str) -> Option<ErrorCode> {
    if message.contains(COLLECTION_NOT_FOUND_TEXT) {
        return Some(ErrorCode::CollectionNotFound);
    }
    if message.contains(ITEM_NOT_FOUND_TEXT) {
        return Some(ErrorCode::FileNotFound);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{normalize, VAULT_NOT_FOUND_MESSAGE};
    use crate::error::{BackendError, BackendErrorKind, ErrorCode};

    #[test]
    fn kind_wins_over_message_text() {
        let failure = BackendError::new(
            BackendErrorKind::FileNotFound,
            "collection not exist, oddly",
        );
        assert_eq!(normalize(&failure).code, ErrorCode::FileNotFound);
    }

    #[test]
    fn vault_not_found_uses_fixed_message() {
        let failure = BackendError::new(BackendErrorKind::VaultNotFound, "404 from node");
        let err = normalize(&failure);
        assert_eq!(err.code, ErrorCode::VaultNotFound);
        assert_eq!(err.message, VAULT_NOT_FOUND_MESSAGE);
    }

    #[test]
    fn item_not_found_text_maps_to_file_not_found() {
        let failure = BackendError::other("Item not found: /docs/a.txt");
        let err = normalize(&failure);
        assert_eq!(err.code, ErrorCode::FileNotFound);
        assert_eq!(err.message, "Item not found: /docs/a.txt");
    }

    #[test]
    fn io_and_auth_failures_are_unspecified() {
        for kind in [BackendErrorKind::Io, BackendErrorKind::Auth] {
            let err = normalize(&BackendError::new(kind, "boom"));
            assert_eq!(err.code, ErrorCode::Unspecified);
            assert_eq!(err.message, "boom");
        }
    }
}
