//! Core File Task logic

use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::FileTaskResult;
use super::writer::write_atomic;
use crate::modules::completion_client::{CompletionClient, CompletionRequest};
use crate::modules::config::CompletionSettings;
use crate::modules::conversation::{
    render_document, ConversationDocument, ConversationParser, ConversationUnit, ParseConfig, UnitFailure,
};
use crate::modules::error::{ChatpoolError, ChatpoolResult};
use crate::modules::task_runner::{BackoffPolicy, CompletionJob, Outcome, RetryingTaskRunner};

/// Completes every pending conversation of a document and writes it back
///
/// Jobs of one file share a semaphore sized by `max_concurrent`. Permits are
/// handed out in document order, and results land on their own unit so the
/// output keeps source order whatever the finish order.
#[derive(Clone)]
pub struct FileCompletionScheduler {
    runner: RetryingTaskRunner,
    parse_config: ParseConfig,
}

impl FileCompletionScheduler {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self {
            runner: RetryingTaskRunner::new(client, BackoffPolicy::default()),
            parse_config: ParseConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.runner = RetryingTaskRunner::new(self.runner.client(), backoff);
        self
    }

    pub fn with_parse_config(mut self, parse_config: ParseConfig) -> Self {
        self.parse_config = parse_config;
        self
    }

    // === Main Execution ===

    /// Complete `path` and write the result to `new_path`, or back to `path`.
    ///
    /// Parse and configuration errors abort before any job is dispatched.
    /// Per-unit failures never abort; they show up as markers and in the
    /// aggregate status. Once `cancel` fires no further unit is admitted.
    pub async fn complete_file(
        &self,
        path: &Path,
        new_path: Option<&Path>,
        settings: &CompletionSettings,
        cancel: &CancellationToken,
    ) -> ChatpoolResult<FileTaskResult> {
        let start_time = Instant::now();
        settings.validate()?;
        let destination = new_path.unwrap_or(path);

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ChatpoolError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let mut document = ConversationParser::with_config(self.parse_config.clone())
            .parse(&text)
            .map_err(|source| ChatpoolError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        info!(
            "Completing {}: {} unit(s), {} pending, max {} parallel",
            path.display(),
            document.units.len(),
            document.pending_count(),
            settings.concurrency()
        );

        let jobs_dispatched = self.complete_document(&mut document, settings, cancel).await;

        write_atomic(destination, render_document(&document)).await?;

        let result = FileTaskResult::from_document(
            path.to_path_buf(),
            destination.to_path_buf(),
            &document,
            jobs_dispatched,
            start_time.elapsed().as_millis() as u64,
        );
        info!("{}", result.summary());
        Ok(result)
    }

    /// Run a job for every pending unit under the concurrency cap. Returns the
    /// number of jobs dispatched.
    pub async fn complete_document(
        &self,
        document: &mut ConversationDocument,
        settings: &CompletionSettings,
        cancel: &CancellationToken,
    ) -> usize {
        let semaphore = Semaphore::new(settings.concurrency());
        let semaphore = &semaphore;

        let tasks: Vec<_> = document
            .units
            .iter_mut()
            .filter(|unit| unit.needs_completion())
            .map(|unit| async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return false;
                };
                if cancel.is_cancelled() {
                    debug!("Unit {} left pending, run cancelled", unit.position());
                    return false;
                }
                self.complete_unit(unit, settings).await;
                true
            })
            .collect();

        let dispatched = join_all(tasks).await.into_iter().filter(|d| *d).count();
        if cancel.is_cancelled() {
            warn!("Run cancelled, {} pending unit(s) not dispatched", document.pending_count());
        }
        dispatched
    }

    /// Execute one admitted unit and record its terminal state on it
    async fn complete_unit(&self, unit: &mut ConversationUnit, settings: &CompletionSettings) {
        let mut job = CompletionJob::new(
            unit.position(),
            CompletionRequest::for_unit(unit, &settings.model),
            settings.timeout(),
            settings.retries,
        );
        unit.mark_in_progress();

        match self.runner.run(&mut job).await {
            Outcome::Success { content, attempts } => unit.set_completed(content, attempts),
            Outcome::Failure { kind, error, attempts } => unit.set_failed(UnitFailure {
                kind,
                message: error.to_string(),
                attempts,
            }),
        }
    }
}
