//! Report data structure (HTML is generated in the xmrtrace_report crate).

use crate::compute::RunReport;
use crate::verify::ResidualBundle;
use serde::{Deserialize, Serialize};

/// Data passed to the HTML report generator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportData {
    pub bundle: ResidualBundle,
    pub reproducibility_hash_sha256: String,
    /// Completion report of the run that produced the bundle, when rendered right after one.
    pub last_run: Option<RunReport>,
}
