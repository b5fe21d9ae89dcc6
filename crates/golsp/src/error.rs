//
// error.rs
//
// Error taxonomy shared by the loader, the unit caches and the handlers
//

use std::path::PathBuf;

use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::Position;

use crate::overlay::OverlayError;

/// Failure of a unit or summary load. Cloned to every caller waiting on the
/// same in-flight load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("load cancelled")]
    Cancelled,

    #[error("{} is not a Go source file", path.display())]
    NotGoFile { path: PathBuf },

    #[error("{} is excluded by the active build configuration", path.display())]
    BuildConfigurationExcluded { path: PathBuf },

    #[error("no buildable Go source files in {}", dir.display())]
    NoBuildableFiles { dir: PathBuf },

    #[error("toolchain failure while loading {unit}: {message}")]
    Toolchain { unit: String, message: String },

    #[error("failed to read {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl LoadError {
    /// Whether a failed cache entry holding this error should be reloaded on
    /// the next request rather than waiting for an invalidating change.
    pub fn retryable(&self) -> bool {
        matches!(self, LoadError::Toolchain { .. } | LoadError::Io { .. })
    }
}

/// Handler-level error. Most variants degrade to an empty result.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("no information at {}:{}:{}", path.display(), position.line, position.character)]
    InvalidPosition { path: PathBuf, position: Position },

    #[error("{} is excluded by the active build configuration", path.display())]
    BuildConfigurationExcluded { path: PathBuf },

    #[error("no buildable Go source files in {}", dir.display())]
    NoBuildableFiles { dir: PathBuf },

    #[error("{0}")]
    ToolchainFailure(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid edit: {0}")]
    InvalidOverlayEdit(#[from] OverlayError),

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

pub type LspResult<T> = std::result::Result<T, LspError>;

impl From<LoadError> for LspError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Cancelled => LspError::Cancelled,
            LoadError::NotGoFile { path } | LoadError::BuildConfigurationExcluded { path } => {
                LspError::BuildConfigurationExcluded { path }
            }
            LoadError::NoBuildableFiles { dir } => LspError::NoBuildableFiles { dir },
            err @ (LoadError::Toolchain { .. } | LoadError::Io { .. }) => {
                LspError::ToolchainFailure(err.to_string())
            }
        }
    }
}

impl LspError {
    /// Errors that are expected while browsing and must not reach the user.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            LspError::InvalidPosition { .. }
                | LspError::BuildConfigurationExcluded { .. }
                | LspError::NoBuildableFiles { .. }
        )
    }

    /// Convert into the JSON-RPC result of a request whose result is
    /// optional.
    pub fn into_response<T>(self) -> jsonrpc::Result<Option<T>> {
        match self {
            err if err.is_silent() => {
                log::debug!("{}", err);
                Ok(None)
            }
            LspError::Cancelled => {
                log::trace!("request cancelled");
                Err(request_cancelled())
            }
            LspError::InvalidParams(message) => Err(jsonrpc::Error::invalid_params(message)),
            err => {
                log::error!("{}", err);
                Err(jsonrpc::Error {
                    code: jsonrpc::ErrorCode::InternalError,
                    message: err.to_string().into(),
                    data: None,
                })
            }
        }
    }
}

pub fn request_cancelled() -> jsonrpc::Error {
    jsonrpc::Error {
        code: jsonrpc::ErrorCode::RequestCancelled,
        message: "request cancelled".into(),
        data: None,
    }
}

/// Flatten a handler result into the shape tower-lsp expects.
pub fn respond<T>(result: LspResult<Option<T>>) -> jsonrpc::Result<Option<T>> {
    result.or_else(LspError::into_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let toolchain = LoadError::Toolchain {
            unit: "p".into(),
            message: "boom".into(),
        };
        assert!(toolchain.retryable());
        assert!(!LoadError::NoBuildableFiles { dir: "/x".into() }.retryable());
        assert!(!LoadError::Cancelled.retryable());
    }

    #[test]
    fn test_silent_errors_become_empty_results() {
        let err = LspError::from(LoadError::BuildConfigurationExcluded {
            path: "/x/a_windows.go".into(),
        });
        assert!(err.is_silent());
        let result: jsonrpc::Result<Option<u32>> = err.into_response();
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_cancelled_maps_to_request_cancelled() {
        let result: jsonrpc::Result<Option<u32>> = LspError::Cancelled.into_response();
        assert_eq!(result.unwrap_err().code, jsonrpc::ErrorCode::RequestCancelled);
    }

    #[test]
    fn test_toolchain_failure_is_internal_error() {
        let err = LspError::from(LoadError::Toolchain {
            unit: "example.com/m/p".into(),
            message: "crashed".into(),
        });
        let result: jsonrpc::Result<Option<u32>> = err.into_response();
        let err = result.unwrap_err();
        assert_eq!(err.code, jsonrpc::ErrorCode::InternalError);
        assert!(err.message.contains("example.com/m/p"));
    }
}
