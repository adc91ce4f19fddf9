use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SdkError {
    #[error("invalid individual id: {0}")]
    InvalidIndividualId(String),

    #[error("duplicate individual in {cohort}: {id}")]
    DuplicateIndividual { cohort: String, id: String },

    #[error("invalid config name: {0}")]
    InvalidConfigName(String),

    #[error(
        "mismatch between root keys in config and request. config: {expected:?}, request: {requested:?}"
    )]
    RootKeyMismatch {
        expected: Vec<String>,
        requested: Vec<String>,
    },

    #[error("config file '{0}' not found")]
    ConfigNotFound(String),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("configs directory not found at {0}")]
    #[diagnostic(help("create a `configs/` directory inside the module directory"))]
    ConfigsDirMissing(Utf8PathBuf),

    #[error("scratch directory error: {0}")]
    Directory(String),

    #[error("genotype archive error: {0}")]
    Archive(String),

    #[error("failed to download genotype for parent {id}: {reason}")]
    InputUnavailable { id: String, reason: String },

    #[error("module execution failed: {0}")]
    ModuleExecution(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("http client error: {0}")]
    HttpClient(String),

    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("server error: {0}")]
    Server(String),
}

impl SdkError {
    pub fn kind(&self) -> &'static str {
        match self {
            SdkError::InvalidIndividualId(_) => "invalid_individual_id",
            SdkError::DuplicateIndividual { .. } => "duplicate_individual",
            SdkError::InvalidConfigName(_) => "invalid_config_name",
            SdkError::RootKeyMismatch { .. } => "root_key_mismatch",
            SdkError::ConfigNotFound(_) => "config_not_found",
            SdkError::ConfigParse(_) => "config_parse",
            SdkError::ConfigInvalid(_) => "config_invalid",
            SdkError::ConfigsDirMissing(_) => "configs_dir_missing",
            SdkError::Directory(_) => "directory",
            SdkError::Archive(_) => "archive",
            SdkError::InputUnavailable { .. } => "input_unavailable",
            SdkError::ModuleExecution(_) => "module_execution",
            SdkError::Cancelled(_) => "cancelled",
            SdkError::HttpClient(_) => "http_client",
            SdkError::Bind { .. } => "bind",
            SdkError::Server(_) => "server",
        }
    }

    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            SdkError::ConfigsDirMissing(_) | SdkError::Bind { .. } | SdkError::HttpClient(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum TransferError {
    #[error("transfer timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Network(String),

    #[error("object store returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("local file error at {path}: {message}")]
    LocalIo { path: String, message: String },

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Timeout(_) | TransferError::Network(_) => true,
            TransferError::Status { status, .. } => is_retryable_status(*status),
            TransferError::LocalIo { .. } | TransferError::Cancelled => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout(err.to_string())
        } else {
            TransferError::Network(err.to_string())
        }
    }

    pub(crate) fn local(path: impl ToString, err: std::io::Error) -> Self {
        TransferError::LocalIo {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
