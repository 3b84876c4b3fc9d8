//! One analysis run, end to end.
//!
//! target → evidence → request text → reasoning service → decision → dispatch

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AnalyzerConfig;
use crate::decision::{self, ChatCompletionClient, DecisionClient, DecisionOutcome, RetryingClient};
use crate::dispatch::{ActionDispatcher, DispatchReport, NotificationSettings};
use crate::error::{AnalyzerError, TransportError};
use crate::evidence::{EvidenceAggregator, EvidenceReport, SourceLimits};
use crate::guard::{self, Interrupted};
use crate::pending::PendingStore;
use crate::prompt::PromptBuilder;
use crate::sources::{KubePodSource, LokiClient, PodSource, PrometheusClient, UnavailablePodSource};
use crate::target::{ResolvedTarget, Target};

/// Everything one run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub target: ResolvedTarget,
    pub evidence: EvidenceReport,
    pub outcome: DecisionOutcome,
    pub dispatch: DispatchReport,
}

/// The analysis pipeline. Holds no per-run state.
pub struct Pipeline {
    aggregator: EvidenceAggregator,
    prompt: PromptBuilder,
    client: Arc<dyn DecisionClient>,
    dispatcher: ActionDispatcher,
    decision_timeout: Duration,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        aggregator: EvidenceAggregator,
        prompt: PromptBuilder,
        client: Arc<dyn DecisionClient>,
        dispatcher: ActionDispatcher,
    ) -> Self {
        Self {
            aggregator,
            prompt,
            client,
            dispatcher,
            decision_timeout: Duration::from_secs(120),
        }
    }

    /// Overall limit on the reasoning call, retries included.
    #[must_use]
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// Wire the production collaborators described by `config`.
    pub async fn from_config(
        config: &AnalyzerConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, AnalyzerError> {
        config.validate_notification()?;

        let aggregator = aggregator_from_config(config).await;
        let prompt = PromptBuilder::new(config.workload.clone())?;

        let client = RetryingClient::new(
            ChatCompletionClient::from_config(&config.llm),
            config.llm.max_attempts,
            Duration::from_millis(config.llm.retry_delay_ms),
        )
        .with_cancellation(cancel.clone());

        let dispatcher = dispatcher_from_config(config);

        Ok(Self::new(aggregator, prompt, Arc::new(client), dispatcher)
            .with_decision_timeout(config.llm.total_budget()))
    }

    /// Run the full pipeline for `target`.
    ///
    /// # Errors
    /// Any run-fatal condition. Notification failures are not errors; they
    /// are reported in [`RunReport::dispatch`].
    pub async fn run(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AnalyzerError> {
        let run_id = Uuid::new_v4();
        let resolved = target.resolve()?;
        let span = info_span!(
            "analysis_run",
            %run_id,
            namespace = %resolved.namespace,
            selector = %resolved.label_selector
        );

        self.run_resolved(run_id, resolved, cancel)
            .instrument(span)
            .await
    }

    async fn run_resolved(
        &self,
        run_id: Uuid,
        target: ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AnalyzerError> {
        info!("Starting analysis run");

        let evidence = self.aggregator.aggregate(&target, cancel).await?;
        let request = self.prompt.build(&target, &evidence, Utc::now())?;
        debug!(chars = request.len(), "Built reasoning request");

        let raw = match guard::bounded(self.decision_timeout, cancel, self.client.send(&request))
            .await
        {
            Ok(result) => result?,
            Err(Interrupted::Cancelled) => return Err(AnalyzerError::Cancelled),
            Err(Interrupted::Timeout(d)) => return Err(TransportError::Timeout(d).into()),
        };
        debug!(raw = %raw, "Reasoning service replied");

        let outcome = decision::parse(&raw)?;
        info!(action = outcome.action(), reason = %outcome.reason(), "Decision reached");

        let dispatch = self.dispatcher.dispatch(&outcome, Utc::now(), cancel).await;

        Ok(RunReport {
            run_id,
            target,
            evidence,
            outcome,
            dispatch,
        })
    }
}

/// Build the evidence aggregator over the cluster, Prometheus and Loki.
///
/// A cluster client that cannot be built only makes the resources section
/// unavailable.
pub async fn aggregator_from_config(config: &AnalyzerConfig) -> EvidenceAggregator {
    let pods: Arc<dyn PodSource> = match KubePodSource::try_default().await {
        Ok(source) => Arc::new(source),
        Err(e) => {
            let reason = format!("{e:#}");
            warn!(error = %reason, "Kubernetes client unavailable; pod evidence will be missing");
            Arc::new(UnavailablePodSource::new(reason))
        }
    };

    let limits = SourceLimits {
        pods_timeout: config.kubernetes.timeout(),
        alerts_timeout: Duration::from_secs(config.prometheus.timeout_secs),
        logs_timeout: Duration::from_secs(config.loki.timeout_secs),
        max_log_lines: config.loki.limit as usize,
    };

    EvidenceAggregator::new(
        pods,
        Arc::new(PrometheusClient::new(config.prometheus.clone())),
        Arc::new(LokiClient::new(config.loki.clone())),
    )
    .with_limits(limits)
}

/// Build the dispatcher delivering through Feishu and spooling to `pending_dir`.
#[must_use]
pub fn dispatcher_from_config(config: &AnalyzerConfig) -> ActionDispatcher {
    let feishu = &config.feishu;
    let channel = notify::FeishuChannel::from_env(
        &feishu.base_url,
        &feishu.app_id_env,
        &feishu.app_secret_env,
        Duration::from_secs(feishu.timeout_secs),
    );

    ActionDispatcher::new(Arc::new(channel), NotificationSettings::from_config(feishu))
        .with_pending_store(PendingStore::new(&config.pending_dir))
}
