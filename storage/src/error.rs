use std::fmt;

/// Failures reading backups from object storage
#[derive(Debug)]
pub enum StorageError {
    /// A request to the S3 service failed
    Request {
        operation: &'static str,
        bucket: String,
        message: String,
    },
    /// Credentials or location that can never work
    Configuration(String),
    /// No such backup
    NotFound(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub(crate) fn request(
        operation: &'static str,
        bucket: &str,
        error: &dyn std::error::Error,
    ) -> Self {
        StorageError::Request {
            operation,
            bucket: bucket.to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Request {
                operation,
                bucket,
                message,
            } => write!(f, "{operation} on bucket {bucket} failed: {message}"),
            StorageError::Configuration(msg) => write!(f, "invalid storage settings: {msg}"),
            StorageError::NotFound(what) => write!(f, "{what} not found"),
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_name_operation_and_bucket() {
        let io = std::io::Error::other("connection reset");
        let err = StorageError::request("ListObjectsV2", "orders-backups", &io);

        assert_eq!(
            err.to_string(),
            "ListObjectsV2 on bucket orders-backups failed: connection reset"
        );
        assert!(!err.is_not_found());
    }
}
