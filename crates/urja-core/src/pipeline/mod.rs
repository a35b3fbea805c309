//! Production build pipeline.
//!
//! A build runs six steps in a fixed order over one [`BuildContext`]:
//! Resolver → Transformer → Bundler → Optimizer → CssOptimizer → Outputter.
//! The whole sequence races a timeout; on expiry the caller gets
//! [`Error::Timeout`] while the spawned sequence is left to finish on its own.

mod cache;
mod context;
mod steps;

pub use cache::{BuildCache, BUILD_CACHE_DIR};
pub use context::{
    BuildContext, ChunkDescriptor, ChunkKind, FileManifest, ManifestEntry, ModuleGraph,
    OptimizedChunk, StepKind,
};
pub use steps::{
    BundlerStep, CssOptimizerStep, OptimizerStep, OutputterStep, ResolverStep, TransformerStep,
    CHUNK_SIZE_WARNING, MANIFEST_FILE,
};

use crate::config::BuildConfig;
use crate::engine::Engine;
use crate::error::Error;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One pipeline stage.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error>;
}

/// The six step slots. Any slot can be replaced, none can be moved or removed.
#[derive(Clone)]
pub struct Pipeline {
    resolver: Arc<dyn Step>,
    transformer: Arc<dyn Step>,
    bundler: Arc<dyn Step>,
    optimizer: Arc<dyn Step>,
    css_optimizer: Arc<dyn Step>,
    outputter: Arc<dyn Step>,
}

impl Pipeline {
    /// The built-in steps, bundling through `engine`.
    #[must_use]
    pub fn standard(engine: Arc<dyn Engine>) -> Self {
        Self {
            resolver: Arc::new(ResolverStep),
            transformer: Arc::new(TransformerStep::default()),
            bundler: Arc::new(BundlerStep::new(engine)),
            optimizer: Arc::new(OptimizerStep),
            css_optimizer: Arc::new(CssOptimizerStep),
            outputter: Arc::new(OutputterStep),
        }
    }

    #[must_use]
    pub fn with_step(mut self, kind: StepKind, step: impl Step + 'static) -> Self {
        let step: Arc<dyn Step> = Arc::new(step);
        match kind {
            StepKind::Resolver => self.resolver = step,
            StepKind::Transformer => self.transformer = step,
            StepKind::Bundler => self.bundler = step,
            StepKind::Optimizer => self.optimizer = step,
            StepKind::CssOptimizer => self.css_optimizer = step,
            StepKind::Outputter => self.outputter = step,
        }
        self
    }

    fn slot(&self, kind: StepKind) -> &Arc<dyn Step> {
        match kind {
            StepKind::Resolver => &self.resolver,
            StepKind::Transformer => &self.transformer,
            StepKind::Bundler => &self.bundler,
            StepKind::Optimizer => &self.optimizer,
            StepKind::CssOptimizer => &self.css_optimizer,
            StepKind::Outputter => &self.outputter,
        }
    }

    async fn run_steps(&self, mut ctx: BuildContext) -> Result<BuildContext, Error> {
        for kind in StepKind::ALL {
            let step = self.slot(kind);
            let span = info_span!("step", step = kind.as_str(), name = step.name());
            let started = Instant::now();

            ctx.begin(kind);
            if let Err(e) = step.run(&mut ctx).instrument(span.clone()).await {
                error!(parent: &span, error = %e, "step failed");
                return Err(e);
            }
            ctx.finish(kind);

            debug!(
                parent: &span,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "step finished"
            );
        }
        Ok(ctx)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(StepKind::ALL.iter().map(|k| self.slot(*k).name()))
            .finish()
    }
}

/// Runs a [`Pipeline`] under the config's time budget.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    pipeline: Arc<Pipeline>,
}

impl PipelineExecutor {
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// Executor over [`Pipeline::standard`].
    #[must_use]
    pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
        Self::new(Pipeline::standard(engine))
    }

    /// Run every step and return the final context.
    ///
    /// Fails with the first step error, or with [`Error::Timeout`] once
    /// `config.pipeline_timeout()` elapses. A timed-out sequence is not
    /// cancelled; it keeps running detached until it settles.
    pub async fn execute(&self, config: BuildConfig) -> Result<BuildContext, Error> {
        let budget = config.pipeline_timeout();
        let root = config.root.display().to_string();
        let pipeline = Arc::clone(&self.pipeline);
        let started = Instant::now();
        info!(root = %root, mode = %config.mode, "build started");

        let mut task = tokio::spawn(async move { pipeline.run_steps(BuildContext::new(config)).await });

        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    info!(
                        root = %root,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "build finished"
                    );
                }
                result
            }
            Ok(Err(join)) => Err(Error::other(format!("Build task failed: {join}"))),
            Err(_) => {
                warn!(
                    root = %root,
                    budget_ms = budget.as_millis() as u64,
                    "build timed out; abandoning running steps"
                );
                Err(Error::Timeout { budget })
            }
        }
    }
}
