use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::StoreError;

/// Longest label name accepted by the registry.
pub const MAX_LABEL_NAME_LEN: usize = 100;

/// Translate rusqlite errors into friendlier StoreError variants.
pub(crate) fn map_sql_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(sql_err, _)
            if sql_err.code == rusqlite::ErrorCode::DatabaseBusy
                || sql_err.code == rusqlite::ErrorCode::DatabaseLocked =>
        {
            StoreError::Busy
        }
        rusqlite::Error::InvalidQuery
        | rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::MultipleStatement => StoreError::Unexpected,
        other => StoreError::Sql(other),
    }
}

/// Normalize a relative path for stable database storage.
///
/// Rejects absolute paths, parent traversal, root prefixes, and empty paths.
pub fn normalize_relative_path(path: &Path) -> Result<String, StoreError> {
    let cleaned = sanitize_relative_path(path)?;
    Ok(cleaned.to_string_lossy().replace('\\', "/"))
}

/// Parse and validate a stored relative path from the database.
pub(crate) fn parse_relative_path_from_db(path: &str) -> Result<PathBuf, StoreError> {
    sanitize_relative_path(Path::new(path))
}

fn sanitize_relative_path(path: &Path) -> Result<PathBuf, StoreError> {
    if path.is_absolute() {
        return Err(StoreError::PathMustBeRelative(path.to_path_buf()));
    }
    let mut cleaned = PathBuf::new();
    let mut saw_component = false;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                cleaned.push(part);
                saw_component = true;
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidRelativePath(path.to_path_buf()));
            }
        }
    }
    if !saw_component {
        return Err(StoreError::InvalidRelativePath(path.to_path_buf()));
    }
    Ok(cleaned)
}

/// Check that a label name can double as a single directory name.
///
/// Returns the trimmed name.
pub fn validate_label_name(name: &str) -> Result<String, StoreError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed.len() > MAX_LABEL_NAME_LEN
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\', '\0'])
        || trimmed.chars().any(char::is_control);
    if invalid {
        return Err(StoreError::InvalidLabelName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn create_parent_if_needed(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

pub(crate) fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_relative_path_rejects_parent_dir() {
        let err = normalize_relative_path(Path::new("../escape.png")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRelativePath(_)));
    }

    #[test]
    fn normalize_relative_path_rejects_empty_or_curdir_only() {
        let err = normalize_relative_path(Path::new(".")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRelativePath(_)));
        let err = normalize_relative_path(Path::new("")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRelativePath(_)));
    }

    #[test]
    fn normalize_relative_path_skips_curdir_components() {
        let normalized = normalize_relative_path(Path::new("pizza/./a.png")).unwrap();
        assert_eq!(normalized, "pizza/a.png");
    }

    #[test]
    fn label_names_must_be_single_directory_names() {
        assert_eq!(validate_label_name("  pizza ").unwrap(), "pizza");
        assert_eq!(validate_label_name("ice cream").unwrap(), "ice cream");
        for bad in ["", "   ", "a/b", "a\\b", ".hidden", "..", "tab\there"] {
            assert!(
                matches!(validate_label_name(bad), Err(StoreError::InvalidLabelName(_))),
                "{bad:?} should be rejected"
            );
        }
        let long = "x".repeat(MAX_LABEL_NAME_LEN + 1);
        assert!(validate_label_name(&long).is_err());
    }
}
