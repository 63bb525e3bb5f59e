//! Guarded job state machine.
//!
//! ```text
//! initialized -> start -> dump -> download -> upload -> cleanup -> backuped
//!                  \_____________________________/^
//!                   (sftp-copy, read-only-dedup-mirror)
//! ```
//!
//! Every non-terminal state can also move to `failed`. A transition is
//! committed only after its guard passed and its handler succeeded. A
//! handler error moves the job to `failed` before the error is returned.

use std::fmt;

use crate::context::AppContext;
use crate::core::error::{OrchestratorError, Result};
use crate::core::guards::{GuardMode, Guards, Verdict};
use crate::core::handlers::Handlers;
use crate::core::models::{Host, Job, JobState, JobTemplate, Repository};
use crate::core::notifications::FailureReport;
use crate::core::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Start,
    Dump,
    Download,
    Upload,
    Cleanup,
    Backuped,
    Failed,
}

impl Transition {
    pub fn target(self) -> JobState {
        match self {
            Self::Start => JobState::Start,
            Self::Dump => JobState::Dump,
            Self::Download => JobState::Download,
            Self::Upload => JobState::Upload,
            Self::Cleanup => JobState::Cleanup,
            Self::Backuped => JobState::Backuped,
            Self::Failed => JobState::Failed,
        }
    }

    /// States this transition may leave from, before source-type filtering.
    fn sources(self) -> &'static [JobState] {
        use JobState::*;
        match self {
            Self::Start => &[Initialized],
            Self::Dump => &[Start],
            Self::Download => &[Dump],
            Self::Upload => &[Start, Download],
            Self::Cleanup => &[Upload],
            Self::Backuped => &[Cleanup],
            Self::Failed => &[Initialized, Start, Dump, Download, Upload, Cleanup],
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.target().as_str()
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A template with the records it references.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub template: JobTemplate,
    pub repository: Repository,
    pub host: Option<Host>,
}

impl JobContext {
    pub async fn load(store: &dyn JobStore, template: &JobTemplate) -> anyhow::Result<Self> {
        let repository = store.repository(&template.repository_id).await?;
        let host = match &template.host_id {
            Some(id) => Some(store.host(id).await?),
            None => None,
        };

        Ok(Self {
            template: template.clone(),
            repository,
            host,
        })
    }
}

pub struct StateMachine {
    ctx: AppContext,
    guards: Guards,
    handlers: Handlers,
}

impl StateMachine {
    pub fn new(ctx: AppContext) -> Self {
        let handlers = Handlers::new(ctx.clone());
        let guards = Guards::new(ctx.clone(), handlers.clone());
        Self {
            ctx,
            guards,
            handlers,
        }
    }

    /// Whether `transition` leads out of the job's state for its source type.
    /// Guards are not consulted.
    pub fn is_legal(&self, job: &Job, template: &JobTemplate, transition: Transition) -> bool {
        let from = job.state;
        if from.is_terminal() || !transition.sources().contains(&from) {
            return false;
        }

        let source_type = template.source_type;
        match (from, transition) {
            (JobState::Start, Transition::Upload) => source_type.is_direct(),
            (_, Transition::Failed) => true,
            _ => source_type.visits(transition.target()),
        }
    }

    /// Legal and not blocked by its guard. Runs no compensating actions.
    pub async fn can(&self, job: &Job, jc: &JobContext, transition: Transition) -> bool {
        self.is_legal(job, &jc.template, transition)
            && self
                .guards
                .check(job, jc, transition, GuardMode::Probe)
                .await
                .is_pass()
    }

    pub async fn apply(&self, job: &mut Job, jc: &JobContext, transition: Transition) -> Result<()> {
        if !self.is_legal(job, &jc.template, transition) {
            return Err(OrchestratorError::IllegalTransition {
                from: job.state,
                transition,
            });
        }

        if transition == Transition::Failed {
            self.fail(job, jc, "failed on request").await;
            return Ok(());
        }

        if let Verdict::Block(reason) = self
            .guards
            .check(job, jc, transition, GuardMode::Enforce)
            .await
        {
            self.ctx
                .audit
                .warning(job, format!("Transition '{}' blocked: {}", transition, reason))
                .await;
            return Err(OrchestratorError::BlockedTransition { transition, reason });
        }

        if let Err(e) = self.handlers.run(transition, job, jc).await {
            self.ctx
                .audit
                .error(job, format!("Transition '{}' failed: {}", transition, e))
                .await;
            self.fail(job, jc, &e.to_string()).await;
            return Err(e);
        }

        let from = job.state;
        job.state = transition.target();
        job.updated_at = self.ctx.clock.now();
        if let Err(e) = self.ctx.store.save(job).await {
            // The handler ran but the state did not stick; the job stays where
            // it was on disk and the (idempotent) transition is retried later.
            job.state = from;
            return Err(e.into());
        }

        self.ctx
            .audit
            .info(job, format!("Entered state '{}'", job.state))
            .await;
        Ok(())
    }

    /// Move the job to `failed` without consulting guards. Terminal jobs are left alone.
    pub async fn fail(&self, job: &mut Job, jc: &JobContext, reason: &str) {
        if job.state.is_terminal() {
            return;
        }

        let failed_in = job.state;
        job.state = JobState::Failed;
        job.updated_at = self.ctx.clock.now();

        if let Err(e) = self.ctx.store.save(job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist failed state");
        }

        self.ctx
            .audit
            .error(job, format!("Entered state 'failed' from '{}': {}", failed_in, reason))
            .await;

        // The next job never looks at this one's staged file or snapshot.
        if let Err(e) = self.handlers.release_artifacts(job, jc).await {
            self.ctx
                .audit
                .warning(job, format!("Could not release artifacts of failed job: {}", e))
                .await;
        }

        if let Some(notifier) = &self.ctx.notifier {
            let report = FailureReport {
                job_id: job.id.clone(),
                template_name: jc.template.name.clone(),
                template_slug: jc.template.slug.clone(),
                failed_in: failed_in.to_string(),
                reason: reason.to_string(),
            };
            if let Err(e) = notifier.send_failure_report(report).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to send failure report");
            }
        }
    }
}
