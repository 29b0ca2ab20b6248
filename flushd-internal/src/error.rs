use std::fmt::Display;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    /// Build an error whose logging is left to the caller.
    ///
    /// Storage and backend adapters use this: the component that handles the
    /// failure knows which report, credentials or request it belonged to and
    /// logs it with that context instead.
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        self.0.is_transient()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ErrorDetails {
    /// The usage backend could not be reached, timed out or answered with a 5xx.
    BackendUnavailable {
        message: String,
    },
    /// The usage backend rejected the request parameters.
    BackendBadRequest {
        status: u16,
        message: String,
    },
    /// The usage backend rejected the provider key or the referenced service.
    BackendAuth {
        code: Option<String>,
        message: String,
    },
    /// The backend answered but the body could not be understood.
    BackendResponse {
        message: String,
    },
    StoreUnavailable {
        message: String,
    },
    RenewAuth {
        service_id: String,
        credentials: String,
        message: String,
    },
    InvalidRequestMessage {
        raw: String,
        message: String,
    },
    WorkerPoolClosed {
        pool: String,
    },
    TaskCancelled {
        pool: String,
    },
    Config {
        message: String,
    },
    Observability {
        message: String,
    },
    InternalError {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::BackendUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::BackendBadRequest { .. } => tracing::Level::ERROR,
            ErrorDetails::BackendAuth { .. } => tracing::Level::ERROR,
            ErrorDetails::BackendResponse { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::RenewAuth { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequestMessage { .. } => tracing::Level::WARN,
            ErrorDetails::WorkerPoolClosed { .. } => tracing::Level::WARN,
            ErrorDetails::TaskCancelled { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            ErrorDetails::BackendUnavailable { .. }
            | ErrorDetails::StoreUnavailable { .. }
            | ErrorDetails::RenewAuth { .. }
            | ErrorDetails::WorkerPoolClosed { .. }
            | ErrorDetails::TaskCancelled { .. } => true,
            ErrorDetails::BackendBadRequest { .. }
            | ErrorDetails::BackendAuth { .. }
            | ErrorDetails::BackendResponse { .. }
            | ErrorDetails::InvalidRequestMessage { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::InternalError { .. } => false,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::BackendUnavailable { message } => {
                write!(f, "Usage backend unavailable: {message}")
            }
            ErrorDetails::BackendBadRequest { status, message } => {
                write!(
                    f,
                    "Usage backend rejected the request with status {status}: {message}"
                )
            }
            ErrorDetails::BackendAuth { code, message } => match code {
                Some(code) => write!(f, "Usage backend denied access ({code}): {message}"),
                None => write!(f, "Usage backend denied access: {message}"),
            },
            ErrorDetails::BackendResponse { message } => {
                write!(f, "Failed to parse usage backend response: {message}")
            }
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Storage error: {message}")
            }
            ErrorDetails::RenewAuth {
                service_id,
                credentials,
                message,
            } => {
                write!(
                    f,
                    "Failed to renew authorizations for service {service_id} and credentials {credentials}: {message}"
                )
            }
            ErrorDetails::InvalidRequestMessage { raw, message } => {
                write!(f, "Invalid authorization request `{raw}`: {message}")
            }
            ErrorDetails::WorkerPoolClosed { pool } => {
                write!(f, "Worker pool `{pool}` is shut down")
            }
            ErrorDetails::TaskCancelled { pool } => {
                write!(f, "Task in worker pool `{pool}` was cancelled")
            }
            ErrorDetails::Config { message } => write!(f, "Configuration error: {message}"),
            ErrorDetails::Observability { message } => {
                write!(f, "Failed to set up observability: {message}")
            }
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::error::Error for Error {}
