use std::sync::Arc;

use tracing::{error, warn};

use crate::credentials::Credentials;
use crate::error::Error;
use crate::storage::{Report, Storage};

/// Decides what happens to the failures of a flush cycle.
///
/// Reports that could not be delivered are put back in the store so their usage is
/// sent on the next cycle. Failed authorizations and renewals are only logged:
/// the next cycle, or a priority request, renews them.
pub struct FlusherErrorHandler {
    storage: Arc<Storage>,
}

impl FlusherErrorHandler {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub async fn handle_report_errors(&self, failed: Vec<(Report, Error)>) {
        if failed.is_empty() {
            return;
        }
        for (report, e) in &failed {
            log_error(
                e,
                &report.service_id,
                &report.credentials,
                "Failed to report usage. It will be sent in the next flush",
            );
        }

        let reports: Vec<Report> = failed.into_iter().map(|(report, _)| report).collect();
        if let Err(e) = self.storage.report(&reports).await {
            error!(
                error = %e,
                reports = ?reports,
                "Failed to put back undelivered reports. Their usage is lost"
            );
        }
    }

    pub fn handle_auth_error(&self, service_id: &str, credentials: &Credentials, e: &Error) {
        log_error(e, service_id, credentials, "Failed to renew authorizations");
    }

    pub fn handle_renew_error(&self, service_id: &str, credentials: &Credentials, e: &Error) {
        warn!(
            service_id,
            credentials = %credentials,
            error = %e,
            "Failed to store renewed authorizations"
        );
    }
}

/// Temporary failures are warnings, everything else needs attention.
fn log_error(e: &Error, service_id: &str, credentials: &Credentials, message: &str) {
    if e.is_transient() {
        warn!(service_id, credentials = %credentials, error = %e, "{message}");
    } else {
        error!(service_id, credentials = %credentials, error = %e, "{message}");
    }
}
