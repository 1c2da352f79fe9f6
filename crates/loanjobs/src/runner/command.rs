use std::collections::BTreeMap;
use std::time::Duration;

use super::Invocation;
use crate::config::PipelineSettings;
use crate::job::JobRequest;

/// Keeps the pipeline's own output free of progress bars and buffering.
const QUIET_ENV: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("HF_HUB_DISABLE_PROGRESS_BARS", "1"),
    ("TRANSFORMERS_VERBOSITY", "error"),
    ("TQDM_MININTERVAL", "999999"),
];

const DEFAULT_PROFILE: &str = "default";

/// Builds argv and environment for one job, per the loan pipeline's
/// command-line contract.
pub struct PipelineCommand;

impl PipelineCommand {
    pub fn build(
        settings: &PipelineSettings,
        job_id: &str,
        tenant_id: &str,
        loan_id: &str,
        request: &JobRequest,
        default_timeout: Duration,
    ) -> Invocation {
        let (program, args) = if request.is_query() {
            (
                settings.query_program.clone(),
                Self::query_args(settings, tenant_id, loan_id, request),
            )
        } else {
            (
                settings.program.clone(),
                Self::pipeline_args(settings, tenant_id, loan_id, request),
            )
        };

        Invocation {
            job_id: job_id.to_string(),
            program,
            args,
            env: Self::env(settings, request),
            working_directory: settings.working_directory.clone(),
            timeout: request.timeout(default_timeout),
        }
    }

    fn pipeline_args(
        settings: &PipelineSettings,
        tenant_id: &str,
        loan_id: &str,
        request: &JobRequest,
    ) -> Vec<String> {
        let mut args = settings.args.clone();
        args.extend(["--tenant-id".into(), tenant_id.into()]);
        args.extend(["--loan-id".into(), loan_id.into()]);

        if let Some(run_id) = &request.run_id {
            args.extend(["--run-id".into(), run_id.clone()]);
        }
        if request.skip_intake {
            args.push("--skip-intake".into());
        }
        if request.skip_process {
            args.push("--skip-process".into());
        }
        if let Some(source_path) = &request.source_path {
            args.extend(["--source-path".into(), source_path.clone()]);
        }
        if request.smoke_debug {
            args.push("--debug".into());
        }
        match request.run_llm {
            Some(true) => args.push("--run-llm".into()),
            Some(false) => args.push("--no-run-llm".into()),
            None => {}
        }
        if request.expect_rp_hash_stable {
            args.push("--expect-rp-hash-stable".into());
        }
        args.extend([
            "--max-dropped-chunks".into(),
            request.max_dropped_chunks.to_string(),
        ]);
        if request.offline_embeddings {
            args.push("--offline-embeddings".into());
        }
        args.extend(["--top-k".into(), request.top_k.to_string()]);
        args.extend(["--max-per-file".into(), request.max_per_file.to_string()]);
        args
    }

    fn query_args(
        settings: &PipelineSettings,
        tenant_id: &str,
        loan_id: &str,
        request: &JobRequest,
    ) -> Vec<String> {
        let profile = request.profile.as_deref().unwrap_or(DEFAULT_PROFILE);

        let mut args = settings.query_args.clone();
        args.extend(["--tenant-id".into(), tenant_id.into()]);
        args.extend(["--loan-id".into(), loan_id.into()]);
        args.extend([
            "--run-id".into(),
            request.run_id.clone().unwrap_or_default(),
        ]);
        args.extend([
            "--query".into(),
            request.question.clone().unwrap_or_default(),
        ]);
        args.extend(["--analysis-profile".into(), profile.to_string()]);
        args.extend(["--top-k".into(), request.top_k.to_string()]);
        args.extend(["--max-per-file".into(), request.max_per_file.to_string()]);
        if request.offline_embeddings {
            args.push("--offline-embeddings".into());
        }
        // The decision profile pins its own model.
        if let Some(model) = &request.llm_model {
            if profile != "uw_decision" {
                args.extend(["--llm-model".into(), model.clone()]);
            }
        }
        if request.smoke_debug {
            args.push("--debug".into());
        }
        args
    }

    fn env(settings: &PipelineSettings, request: &JobRequest) -> BTreeMap<String, String> {
        let flag = |on: bool| if on { "1" } else { "0" }.to_string();

        let mut env: BTreeMap<String, String> = QUIET_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("SMOKE_DEBUG".into(), flag(request.smoke_debug));
        env.insert(
            "EXPECT_RP_HASH_STABLE".into(),
            flag(request.expect_rp_hash_stable),
        );
        env.insert(
            "MAX_DROPPED_CHUNKS".into(),
            request.max_dropped_chunks.to_string(),
        );
        if let Some(run_llm) = request.run_llm {
            env.insert(
                "RUN_LLM".into(),
                if run_llm { "True" } else { "False" }.to_string(),
            );
        }

        env.extend(settings.env.clone());
        env
    }
}
