//! Reader for the completion manifest the pipeline writes into its run
//! directory.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobResultSummary;
use crate::store::atomic::read_json;

pub const MANIFEST_FILE: &str = "job_manifest.json";

/// `<base>/tenants/<t>/loans/<l>/<run_id>/job_manifest.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionManifest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub retrieval_pack_sha256: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub generated_at_utc: Option<String>,
    #[serde(default)]
    pub outputs: Option<Value>,
}

impl CompletionManifest {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("SUCCESS")
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    base: PathBuf,
}

impl ArtifactLocator {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn run_dir(&self, tenant_id: &str, loan_id: &str, run_id: &str) -> PathBuf {
        self.base
            .join("tenants")
            .join(tenant_id)
            .join("loans")
            .join(loan_id)
            .join(run_id)
    }

    pub fn manifest_path(&self, tenant_id: &str, loan_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(tenant_id, loan_id, run_id).join(MANIFEST_FILE)
    }

    /// The manifest if present and readable. Unreadable manifests count as
    /// absent.
    pub fn load(&self, tenant_id: &str, loan_id: &str, run_id: &str) -> Option<CompletionManifest> {
        let path = self.manifest_path(tenant_id, loan_id, run_id);
        match read_json(&path) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable completion manifest: {}", e);
                None
            }
        }
    }

    /// Result summary for whatever manifest exists, successful or not.
    pub fn summary(&self, tenant_id: &str, loan_id: &str, run_id: &str) -> Option<JobResultSummary> {
        let manifest = self.load(tenant_id, loan_id, run_id)?;
        Some(self.summarize(tenant_id, loan_id, run_id, &manifest))
    }

    /// Result summary only when the manifest reports success.
    pub fn success_summary(
        &self,
        tenant_id: &str,
        loan_id: &str,
        run_id: &str,
    ) -> Option<JobResultSummary> {
        let manifest = self.load(tenant_id, loan_id, run_id)?;
        if !manifest.is_success() {
            return None;
        }
        Some(self.summarize(tenant_id, loan_id, run_id, &manifest))
    }

    /// Summary for query jobs, which leave no manifest of their own.
    pub fn query_summary(
        &self,
        tenant_id: &str,
        loan_id: &str,
        run_id: Option<&str>,
        succeeded: bool,
    ) -> JobResultSummary {
        JobResultSummary {
            manifest_path: None,
            status: Some(if succeeded { "SUCCESS" } else { "FAIL" }.to_string()),
            rp_sha256: None,
            outputs_base: run_id.map(|r| self.run_dir(tenant_id, loan_id, r).display().to_string()),
        }
    }

    fn summarize(
        &self,
        tenant_id: &str,
        loan_id: &str,
        run_id: &str,
        manifest: &CompletionManifest,
    ) -> JobResultSummary {
        let path = self.manifest_path(tenant_id, loan_id, run_id);
        JobResultSummary {
            manifest_path: Some(path.display().to_string()),
            status: manifest.status.clone(),
            rp_sha256: manifest.retrieval_pack_sha256.clone(),
            outputs_base: path.parent().map(|p| p.display().to_string()),
        }
    }
}
