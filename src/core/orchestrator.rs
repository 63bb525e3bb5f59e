//! Scheduling run: decide per template, then drive jobs forward.
//!
//! A run holds one named lock and makes two passes over the enabled
//! templates. The first pass decides whether to create, resume or supersede
//! a job and kicks it off (`start`, then `dump` or a direct `upload`). The
//! second pass finishes whatever can be finished (`download`, `upload`,
//! `cleanup`, `backuped`). Anything blocked stays where it is for the next
//! run. Errors from one template never stop the others.

use serde::Serialize;
use tracing::{Instrument, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::error::{OrchestratorError, Result};
use crate::core::lock::Lock;
use crate::core::models::{Job, JobState, JobTemplate};
use crate::core::state_machine::{JobContext, StateMachine, Transition};

/// What `resolve_or_advance` decided for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// No usable job existed; a new one was created.
    Created,
    /// A stale in-flight job from an earlier period was failed and replaced.
    Superseded,
    /// The current job was picked up again.
    Resumed,
    /// The period is already settled (backed up, or failed this period).
    Settled,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub templates: usize,
    pub created: usize,
    pub resumed: usize,
    pub superseded: usize,
    pub settled: usize,
    pub errors: usize,
    pub backuped: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    ctx: AppContext,
    machine: StateMachine,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let machine = StateMachine::new(ctx.clone());
        Self { ctx, machine }
    }

    /// One complete scheduling run under the run lock.
    pub async fn run(&self) -> Result<RunSummary> {
        let name = &self.ctx.config.lock_name;
        let lock = self
            .ctx
            .locks
            .acquire(name, self.ctx.config.lock_ttl())
            .await?
            .ok_or_else(|| OrchestratorError::LockUnavailable(name.clone()))?;

        info!(lock = %name, "Acquired run lock");
        let result = self.run_locked(&lock).await;

        if let Err(e) = self.ctx.locks.release(&lock).await {
            warn!(lock = %name, error = %e, "Failed to release run lock");
        }
        result
    }

    async fn run_locked(&self, lock: &Lock) -> Result<RunSummary> {
        let templates = self.ctx.store.find_all_enabled_templates().await?;
        let mut summary = RunSummary {
            templates: templates.len(),
            ..Default::default()
        };
        info!(templates = templates.len(), "Starting scheduling run");

        for template in &templates {
            self.refresh(lock).await;
            let span = info_span!("resolve", template = %template.slug);
            match self.resolve_or_advance(template).instrument(span).await {
                Ok(Resolution::Created) => summary.created += 1,
                Ok(Resolution::Resumed) => summary.resumed += 1,
                Ok(Resolution::Superseded) => summary.superseded += 1,
                Ok(Resolution::Settled) => summary.settled += 1,
                Err(e) => {
                    summary.errors += 1;
                    error!(template = %template.slug, error = %e, "Could not resolve job");
                }
            }
        }

        for template in &templates {
            self.refresh(lock).await;
            let span = info_span!("complete", template = %template.slug);
            match self.advance_to_completion(template).instrument(span).await {
                Ok(Some(JobState::Backuped)) => summary.backuped += 1,
                Ok(Some(JobState::Failed)) => summary.failed += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.errors += 1;
                    error!(template = %template.slug, error = %e, "Could not advance job");
                }
            }
        }

        info!(
            created = summary.created,
            resumed = summary.resumed,
            superseded = summary.superseded,
            backuped = summary.backuped,
            failed = summary.failed,
            errors = summary.errors,
            "Scheduling run finished"
        );
        Ok(summary)
    }

    async fn refresh(&self, lock: &Lock) {
        match self.ctx.locks.refresh(lock).await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %lock.name, "Run lock lease was lost"),
            Err(e) => warn!(lock = %lock.name, error = %e, "Failed to refresh run lock"),
        }
    }

    /// Decide what to do with the template's latest job and kick it off.
    ///
    /// Only storage errors are returned; transition errors are logged.
    pub async fn resolve_or_advance(&self, template: &JobTemplate) -> Result<Resolution> {
        let jc = JobContext::load(self.ctx.store.as_ref(), template).await?;
        let now = self.ctx.clock.now();
        let latest = self.ctx.store.find_latest_by_template(&template.id).await?;

        let (mut job, resolution) = match latest {
            None => (self.create(&jc).await?, Resolution::Created),
            Some(job) => {
                let same_period = template.periodicity.same_period(job.created_at, now);
                match job.state {
                    JobState::Backuped | JobState::Failed if same_period => {
                        info!(
                            template = %template.slug,
                            job_id = %job.id,
                            state = %job.state,
                            "Nothing to do this period"
                        );
                        return Ok(Resolution::Settled);
                    }
                    JobState::Backuped | JobState::Failed => {
                        (self.create(&jc).await?, Resolution::Created)
                    }
                    state if state.is_in_flight() && !same_period => {
                        let mut stale = job;
                        let reason = format!("abandoned in '{}' since {}", state, stale.updated_at);
                        self.machine.fail(&mut stale, &jc, &reason).await;
                        (self.create(&jc).await?, Resolution::Superseded)
                    }
                    _ => {
                        self.ctx
                            .audit
                            .debug(&job, format!("Resuming job in state '{}'", job.state))
                            .await;
                        (job, Resolution::Resumed)
                    }
                }
            }
        };

        if let Err(e) = self.kick_off(&mut job, &jc).await {
            log_transition_error(&job, &e);
        }
        Ok(resolution)
    }

    async fn create(&self, jc: &JobContext) -> Result<Job> {
        let job = Job::new(&jc.template.id, self.ctx.clock.now());
        self.ctx.store.save(&job).await?;
        self.ctx
            .audit
            .info(&job, format!("Created job for template '{}'", jc.template.slug))
            .await;
        Ok(job)
    }

    async fn kick_off(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        if self.machine.is_legal(job, &jc.template, Transition::Start) {
            self.machine.apply(job, jc, Transition::Start).await?;
        }

        for transition in [Transition::Upload, Transition::Dump] {
            if self.machine.is_legal(job, &jc.template, transition) {
                self.machine.apply(job, jc, transition).await?;
                break;
            }
        }
        Ok(())
    }

    /// Push the template's latest job as far as it goes. Returns its final state.
    pub async fn advance_to_completion(&self, template: &JobTemplate) -> Result<Option<JobState>> {
        let Some(mut job) = self.ctx.store.find_latest_by_template(&template.id).await? else {
            return Ok(None);
        };
        if job.state.is_terminal() {
            return Ok(Some(job.state));
        }

        let jc = JobContext::load(self.ctx.store.as_ref(), template).await?;
        let sequence = [
            Transition::Download,
            Transition::Upload,
            Transition::Cleanup,
            Transition::Backuped,
        ];

        for transition in sequence {
            if !self.machine.is_legal(&job, template, transition) {
                continue;
            }
            if let Err(e) = self.machine.apply(&mut job, &jc, transition).await {
                log_transition_error(&job, &e);
                break;
            }
        }

        Ok(Some(job.state))
    }
}

fn log_transition_error(job: &Job, e: &OrchestratorError) {
    if e.is_blocked() {
        info!(job_id = %job.id, state = %job.state, reason = %e, "Job waits for a later run");
    } else {
        error!(job_id = %job.id, state = %job.state, error = %e, "Job did not advance");
    }
}
