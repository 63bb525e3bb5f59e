//! Guard predicates evaluated before a transition commits.
//!
//! Guards only read state (local files, image status). The one exception is
//! the `backuped` guard, which re-runs cleanup when it finds leftovers and
//! is enforcing rather than probing.

use chrono::Timelike;

use crate::context::AppContext;
use crate::core::handlers::Handlers;
use crate::core::models::{Job, SourceType};
use crate::core::snapshot::ImageService;
use crate::core::staging;
use crate::core::state_machine::{JobContext, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Answer only, e.g. for `can()`.
    Probe,
    /// About to apply the transition; compensating actions are allowed.
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Block(String),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

pub struct Guards {
    ctx: AppContext,
    handlers: Handlers,
}

impl Guards {
    pub fn new(ctx: AppContext, handlers: Handlers) -> Self {
        Self { ctx, handlers }
    }

    pub async fn check(
        &self,
        job: &Job,
        jc: &JobContext,
        transition: Transition,
        mode: GuardMode,
    ) -> Verdict {
        match transition {
            Transition::Start => self.start(jc),
            Transition::Download => self.download(job, jc).await,
            Transition::Upload => self.upload(job, jc).await,
            Transition::Backuped => self.backuped(job, jc, mode).await,
            Transition::Dump | Transition::Cleanup | Transition::Failed => Verdict::Pass,
        }
    }

    fn start(&self, jc: &JobContext) -> Verdict {
        let Some(hour) = jc.template.not_before_hour else {
            return Verdict::Pass;
        };

        let now = self.ctx.clock.now();
        if now.hour() < hour {
            return Verdict::Block(format!(
                "not before {:02}:00 UTC, it is {}",
                hour,
                now.format("%H:%M")
            ));
        }
        Verdict::Pass
    }

    async fn download(&self, job: &Job, jc: &JobContext) -> Verdict {
        if !jc.template.source_type.is_snapshot() {
            return Verdict::Pass;
        }

        let name = job.snapshot_name(&jc.template);
        let images = ImageService::new(self.ctx.executor.as_ref(), &self.ctx.config);

        match images.find(&name).await {
            Ok(Some(info)) if info.is_active() => Verdict::Pass,
            Ok(Some(info)) => Verdict::Block(format!(
                "snapshot {} is '{}', waiting for 'active'",
                name, info.status
            )),
            Ok(None) => Verdict::Block(format!("snapshot {} has not been created", name)),
            Err(e) => Verdict::Block(format!("could not query snapshot {}: {}", name, e)),
        }
    }

    async fn upload(&self, job: &Job, jc: &JobContext) -> Verdict {
        let template = &jc.template;
        if template.source_type.is_direct() {
            return Verdict::Pass;
        }

        let path = staging::staged_path(&self.ctx.config.staging_directory, template, job);
        let size = match staging::staged_size(&path).await {
            Ok(Some(size)) => size,
            Ok(None) => {
                return Verdict::Block(format!("staged artifact {} is missing", path.display()));
            }
            Err(e) => return Verdict::Block(e.to_string()),
        };

        if template.source_type == SourceType::VmSnapshot && size != job.raw_size {
            return Verdict::Block(format!(
                "staged artifact is {} bytes, snapshot is {} bytes",
                size, job.raw_size
            ));
        }

        if size < template.min_artifact_size {
            return Verdict::Block(format!(
                "staged artifact is {} bytes, below the minimum of {}",
                size, template.min_artifact_size
            ));
        }

        Verdict::Pass
    }

    async fn backuped(&self, job: &Job, jc: &JobContext, mode: GuardMode) -> Verdict {
        let Some(leftover) = self.leftover(job, jc).await else {
            return Verdict::Pass;
        };

        if mode == GuardMode::Enforce {
            self.ctx
                .audit
                .warning(job, format!("Job is not clean ({}), retrying cleanup", leftover))
                .await;
            if let Err(e) = self.handlers.cleanup(job, jc).await {
                self.ctx
                    .audit
                    .error(job, format!("Corrective cleanup failed: {}", e))
                    .await;
            }
        }

        Verdict::Block(format!("job is not clean: {}", leftover))
    }

    /// Describe what cleanup left behind, if anything.
    async fn leftover(&self, job: &Job, jc: &JobContext) -> Option<String> {
        let template = &jc.template;

        if template.source_type.stages_locally() {
            let path = staging::staged_path(&self.ctx.config.staging_directory, template, job);
            match staging::staged_size(&path).await {
                Ok(None) => {}
                Ok(Some(_)) => return Some(format!("staged artifact {} still exists", path.display())),
                Err(e) => return Some(e.to_string()),
            }
        }

        if template.source_type.is_snapshot() {
            let name = job.snapshot_name(template);
            let images = ImageService::new(self.ctx.executor.as_ref(), &self.ctx.config);
            match images.find(&name).await {
                Ok(None) => {}
                Ok(Some(info)) => return Some(format!("snapshot {} ({}) still exists", name, info.id)),
                Err(e) => return Some(format!("could not query snapshot {}: {}", name, e)),
            }
        }

        None
    }
}
