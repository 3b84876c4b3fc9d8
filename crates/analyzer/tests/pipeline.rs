//! End-to-end pipeline runs against in-process fakes.

use analyzer::decision::{DecisionClient, DecisionOutcome, RiskLevel};
use analyzer::dispatch::{ActionDispatcher, DispatchReport, NotificationSettings};
use analyzer::error::{AnalyzerError, DecisionError, TransportError};
use analyzer::evidence::{
    EvidenceAggregator, SectionBody, SourceLimits, ALERTS_HEADER, LOGS_HEADER, RESOURCES_HEADER,
};
use analyzer::pending::PendingStore;
use analyzer::pipeline::Pipeline;
use analyzer::prompt::PromptBuilder;
use analyzer::sources::{AlertRecord, AlertSource, LogRecord, LogSource, PodSource};
use analyzer::target::{ResolvedTarget, Target};
use analyzer::config::WorkloadBaseline;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use notify::{CardMessage, ChannelError, DeliveryReceipt, NotifyChannel, ReceiveIdType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "product-a";
const SELECTOR_KEY: &str = "app.kubernetes.io/name";
const SELECTOR_VALUE: &str = "order-service";

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakePods {
    pods: Vec<Pod>,
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl PodSource for FakePods {
    async fn list_pods(&self, _target: &ResolvedTarget) -> anyhow::Result<Vec<Pod>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("cluster API unreachable");
        }
        Ok(self.pods.clone())
    }
}

#[derive(Default)]
struct FakeAlerts {
    alerts: Vec<AlertRecord>,
    hang: bool,
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl AlertSource for FakeAlerts {
    async fn firing_alerts(&self, _target: &ResolvedTarget) -> anyhow::Result<Vec<AlertRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail {
            anyhow::bail!("prometheus returned 503");
        }
        Ok(self.alerts.clone())
    }
}

#[derive(Default)]
struct FakeLogs {
    logs: Vec<LogRecord>,
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl LogSource for FakeLogs {
    async fn error_logs(&self, _target: &ResolvedTarget) -> anyhow::Result<Vec<LogRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("loki returned 401");
        }
        Ok(self.logs.clone())
    }
}

struct FakeReasoner {
    reply: Result<String, TransportError>,
    requests: Mutex<Vec<String>>,
}

impl FakeReasoner {
    fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing(error: TransportError) -> Self {
        Self {
            reply: Err(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl DecisionClient for FakeReasoner {
    async fn send(&self, request_text: &str) -> Result<String, TransportError> {
        self.requests.lock().unwrap().push(request_text.to_string());
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(TransportError::Status { status, body }) => Err(TransportError::Status {
                status: *status,
                body: body.clone(),
            }),
            Err(other) => Err(TransportError::Request(other.to_string())),
        }
    }
}

#[derive(Default)]
struct FakeChannel {
    fail: bool,
    sent: Mutex<Vec<CardMessage>>,
}

impl FakeChannel {
    fn sent(&self) -> Vec<CardMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotifyChannel for FakeChannel {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn deliver(&self, message: &CardMessage) -> Result<DeliveryReceipt, ChannelError> {
        if self.fail {
            return Err(ChannelError::Api {
                code: 230_002,
                msg: "bot not in chat".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryReceipt {
            message_id: Some(format!("om_{}", self.sent.lock().unwrap().len())),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    pods: Arc<FakePods>,
    alerts: Arc<FakeAlerts>,
    logs: Arc<FakeLogs>,
    reasoner: Arc<FakeReasoner>,
    channel: Arc<FakeChannel>,
    pending: Option<PendingStore>,
}

impl Harness {
    fn new(reasoner: FakeReasoner) -> Self {
        Self {
            pods: Arc::new(FakePods {
                pods: vec![pod("order-service-7d9f-abc")],
                ..FakePods::default()
            }),
            alerts: Arc::new(FakeAlerts {
                alerts: vec![AlertRecord {
                    alert_name: "HighCpuUsage".to_string(),
                    namespace: NAMESPACE.to_string(),
                    pod: Some("order-service-7d9f-abc".to_string()),
                }],
                ..FakeAlerts::default()
            }),
            logs: Arc::new(FakeLogs {
                logs: vec![LogRecord {
                    timestamp: Utc.timestamp_opt(1_764_161_100, 0).unwrap(),
                    line: "ERROR request timed out after 30s".to_string(),
                }],
                ..FakeLogs::default()
            }),
            reasoner: Arc::new(reasoner),
            channel: Arc::new(FakeChannel::default()),
            pending: None,
        }
    }

    fn pipeline(&self) -> Pipeline {
        let aggregator = EvidenceAggregator::new(
            self.pods.clone(),
            self.alerts.clone(),
            self.logs.clone(),
        )
        .with_limits(SourceLimits {
            pods_timeout: Duration::from_secs(5),
            alerts_timeout: Duration::from_millis(100),
            logs_timeout: Duration::from_secs(5),
            max_log_lines: 200,
        });

        let mut dispatcher = ActionDispatcher::new(self.channel.clone(), settings());
        if let Some(store) = &self.pending {
            dispatcher = dispatcher.with_pending_store(store.clone());
        }

        Pipeline::new(
            aggregator,
            PromptBuilder::new(WorkloadBaseline::default()).unwrap(),
            self.reasoner.clone(),
            dispatcher,
        )
        .with_decision_timeout(Duration::from_secs(5))
    }
}

fn settings() -> NotificationSettings {
    NotificationSettings {
        receive_id: "oc_ops".to_string(),
        receive_id_type: ReceiveIdType::ChatId,
        template_id: "AAqhGHg0Wgux8".to_string(),
        template_version: "0.0.9".to_string(),
        approval_timeout: chrono::Duration::minutes(10),
        delivery_timeout: Duration::from_secs(5),
    }
}

fn target() -> Target {
    Target::new(
        NAMESPACE,
        BTreeMap::from([(SELECTOR_KEY.to_string(), SELECTOR_VALUE.to_string())]),
    )
}

fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            resource_version: Some("918273".to_string()),
            ..ObjectMeta::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..PodStatus::default()
        }),
    }
}

fn heal_response(risk_level: &str) -> String {
    serde_json::json!({
        "action": "heal",
        "namespace": NAMESPACE,
        "reason": "CPU saturation on order-service",
        "detail": "Throttled at the 2000m limit; scale to 3 replicas",
        "patch_file": "20251126-204555-cpu-spike.yaml",
        "patch_content": [{"op": "replace", "path": "/spec/replicas", "value": 3}],
        "target": {"kind": "Deployment", "labelSelector": format!("{SELECTOR_KEY}={SELECTOR_VALUE}")},
        "suggested_duration": "30m",
        "risk_level": risk_level
    })
    .to_string()
}

const NOOP_RESPONSE: &str = r#"{"action":"noop","reason":"CPU usage nominal"}"#;

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_zero_pods_still_queries_alerts_and_logs() {
    let mut harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));
    harness.pods = Arc::new(FakePods::default());

    let report = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.evidence.resources, SectionBody::Empty);
    assert_eq!(harness.alerts.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.logs.calls.load(Ordering::SeqCst), 1);

    let text = report.evidence.render();
    let resources = text.find(RESOURCES_HEADER).unwrap();
    let alerts = text.find(ALERTS_HEADER).unwrap();
    let logs = text.find(LOGS_HEADER).unwrap();
    assert!(resources < alerts && alerts < logs);
}

#[tokio::test]
async fn test_noop_records_reason_without_notification() {
    let harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));

    let report = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        report.dispatch,
        DispatchReport::Recorded { ref reason } if reason == "CPU usage nominal"
    ));
    assert!(harness.channel.sent().is_empty());
}

#[tokio::test]
async fn test_empty_risk_level_aborts_without_notification() {
    let harness = Harness::new(FakeReasoner::replying(&heal_response("")));

    let err = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AnalyzerError::Decision(DecisionError::Validation { ref field, .. }) if field == "risk_level"
    ));
    assert!(harness.channel.sent().is_empty());
}

#[tokio::test]
async fn test_alert_timeout_degrades_and_run_completes() {
    let mut harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));
    harness.alerts = Arc::new(FakeAlerts {
        hang: true,
        ..FakeAlerts::default()
    });

    let report = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.evidence.alerts.is_unavailable());
    assert!(matches!(report.evidence.resources, SectionBody::Present(_)));
    assert!(matches!(report.evidence.logs, SectionBody::Present(_)));
    assert!(matches!(report.outcome, DecisionOutcome::Noop(_)));

    let request = harness.reasoner.requests.lock().unwrap()[0].clone();
    assert!(request.contains(&format!("{ALERTS_HEADER}\nSource unavailable: timed out")));
}

#[tokio::test]
async fn test_heal_card_carries_namespace_and_selector_verbatim() {
    let harness = Harness::new(FakeReasoner::replying(&heal_response("medium")));

    let report = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap();

    let DecisionOutcome::Heal(heal) = &report.outcome else {
        panic!("expected heal, got {:?}", report.outcome);
    };
    assert_eq!(heal.risk_level, RiskLevel::Medium);

    let sent = harness.channel.sent();
    assert_eq!(sent.len(), 1);
    let card = &sent[0];
    assert_eq!(card.variables.namespace.as_bytes(), heal.namespace.as_bytes());
    assert_eq!(
        card.variables.name.as_bytes(),
        heal.target.label_selector.as_bytes()
    );
    assert_eq!(card.template_id, "AAqhGHg0Wgux8");
    assert!(card
        .variables
        .request_id
        .starts_with("20251126-204555-cpu-spike.yaml-"));

    let DispatchReport::Notified { approval } = &report.dispatch else {
        panic!("expected notified, got {:?}", report.dispatch);
    };
    assert_eq!(approval.request_id, card.variables.request_id);
    assert_eq!(approval.message_id.as_deref(), Some("om_1"));
    assert_eq!(
        approval.expires_at - approval.requested_at,
        chrono::Duration::minutes(10)
    );
}

#[tokio::test]
async fn test_unknown_action_is_never_treated_as_noop() {
    let harness = Harness::new(FakeReasoner::replying(
        r#"{"action":"ignore","reason":"looks fine"}"#,
    ));

    let err = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AnalyzerError::Decision(DecisionError::UnknownAction(ref action)) if action == "ignore"
    ));
    assert!(harness.channel.sent().is_empty());
}

#[tokio::test]
async fn test_non_json_reply_is_parse_error() {
    let harness = Harness::new(FakeReasoner::replying("I think you should scale up."));

    let err = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AnalyzerError::Decision(DecisionError::Parse { .. })
    ));
}

#[tokio::test]
async fn test_all_sources_failing_aborts_before_reasoning() {
    let mut harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));
    harness.pods = Arc::new(FakePods {
        fail: true,
        ..FakePods::default()
    });
    harness.alerts = Arc::new(FakeAlerts {
        fail: true,
        ..FakeAlerts::default()
    });
    harness.logs = Arc::new(FakeLogs {
        fail: true,
        ..FakeLogs::default()
    });

    let err = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AnalyzerError::EvidenceUnavailable { .. }));
    assert_eq!(harness.reasoner.calls(), 0);
}

#[tokio::test]
async fn test_transport_failure_is_fatal() {
    let harness = Harness::new(FakeReasoner::failing(TransportError::Status {
        status: 502,
        body: "bad gateway".to_string(),
    }));

    let err = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AnalyzerError::Transport(TransportError::Status { status: 502, .. })
    ));
    assert!(harness.channel.sent().is_empty());
}

#[tokio::test]
async fn test_empty_selector_is_resolution_error() {
    let harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));

    let err = harness
        .pipeline()
        .run(&Target::new(NAMESPACE, BTreeMap::new()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AnalyzerError::Resolution(_)));
    assert_eq!(harness.pods.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_quote_injection_in_target_never_reaches_reasoner() {
    let harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));
    let hostile = [
        Target::new(
            "prod\",\n  \"action\": \"noop\",\n  \"x\": \"",
            BTreeMap::from([(SELECTOR_KEY.to_string(), SELECTOR_VALUE.to_string())]),
        ),
        Target::new(
            NAMESPACE,
            BTreeMap::from([(
                SELECTOR_KEY.to_string(),
                "web\"\n  \"action\": \"noop".to_string(),
            )]),
        ),
    ];

    for target in &hostile {
        let err = harness
            .pipeline()
            .run(target, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Resolution(_)), "{err:?}");
    }
    assert_eq!(harness.pods.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.reasoner.calls(), 0);
}

#[tokio::test]
async fn test_cancelled_run_stops() {
    let harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness.pipeline().run(&target(), &cancel).await.unwrap_err();

    assert!(matches!(err, AnalyzerError::Cancelled));
    assert_eq!(harness.reasoner.calls(), 0);
}

#[tokio::test]
async fn test_request_carries_evidence_and_facts() {
    let harness = Harness::new(FakeReasoner::replying(NOOP_RESPONSE));

    harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap();

    let request = harness.reasoner.requests.lock().unwrap()[0].clone();
    assert!(request.contains(&format!("- Label selector: {SELECTOR_KEY}={SELECTOR_VALUE}")));
    assert!(request.contains("name: order-service-7d9f-abc"));
    assert!(request.contains("Alert: HighCpuUsage"));
    assert!(request.contains("ERROR request timed out after 30s"));
    assert!(!request.contains("918273"));
}

#[tokio::test]
async fn test_failed_delivery_is_spooled_then_redelivered() {
    let dir = tempfile::tempdir().unwrap();
    let store = PendingStore::new(dir.path());

    let mut harness = Harness::new(FakeReasoner::replying(&heal_response("high")));
    harness.channel = Arc::new(FakeChannel {
        fail: true,
        ..FakeChannel::default()
    });
    harness.pending = Some(store.clone());

    let report = harness
        .pipeline()
        .run(&target(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.dispatch.delivery_failed());
    let DispatchReport::NotificationFailed {
        approval,
        error,
        spooled,
    } = &report.dispatch
    else {
        panic!("expected failed delivery");
    };
    assert!(*spooled);
    assert!(matches!(error, ChannelError::Api { code: 230_002, .. }));

    let pending = store.load().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].approval.request_id, approval.request_id);

    let healthy = Arc::new(FakeChannel::default());
    let dispatcher = ActionDispatcher::new(healthy.clone(), settings());
    let redelivery = dispatcher
        .redeliver(&store, Utc::now(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(redelivery.delivered.len(), 1);
    assert_eq!(redelivery.delivered[0].request_id, approval.request_id);
    assert!(redelivery.remaining.is_empty());
    assert_eq!(healthy.sent()[0].variables.request_id, approval.request_id);
    assert!(store.load().await.unwrap().is_empty());
}
