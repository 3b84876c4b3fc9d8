//! Routing a validated decision to its side effect.
//!
//! A heal proposal becomes an approval card; a noop is only recorded. A
//! failed delivery never turns into a run error: the decision already stands,
//! so the proposal is spooled to the [`PendingStore`] for re-notification.

use chrono::{DateTime, Utc};
use notify::{CardMessage, CardPatch, CardVariables, NotifyChannel, ReceiveIdType};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FeishuConfig;
use crate::decision::{DecisionOutcome, HealAction, RemediationProposal};
use crate::error::DeliveryError;
use crate::guard::{self, Interrupted};
use crate::pending::{PendingNotification, PendingStore};

/// Approval state of one heal proposal.
///
/// Created when the card is first sent. Approval and expiry are driven by
/// card callbacks, which this crate does not handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "messageID")]
    pub message_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved: bool,
    pub approved_by: Option<String>,
    pub reason: String,
}

/// Where and how approval cards are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSettings {
    pub receive_id: String,
    pub receive_id_type: ReceiveIdType,
    pub template_id: String,
    pub template_version: String,
    pub approval_timeout: chrono::Duration,
    pub delivery_timeout: Duration,
}

impl NotificationSettings {
    #[must_use]
    pub fn from_config(config: &FeishuConfig) -> Self {
        Self {
            receive_id: config.receive_id.clone(),
            receive_id_type: config.receive_id_type,
            template_id: config.template_id.clone(),
            template_version: config.template_version.clone(),
            approval_timeout: chrono::Duration::try_minutes(config.approval_timeout_mins)
                .unwrap_or(chrono::Duration::MAX),
            delivery_timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// What dispatch did.
#[derive(Debug)]
pub enum DispatchReport {
    /// Approval card delivered
    Notified { approval: ApprovalRequest },
    /// The decision stands but its card was not delivered
    NotificationFailed {
        approval: ApprovalRequest,
        error: DeliveryError,
        /// Whether the proposal was saved for re-notification
        spooled: bool,
    },
    /// Noop recorded, nothing sent
    Recorded { reason: String },
}

impl DispatchReport {
    #[must_use]
    pub fn delivery_failed(&self) -> bool {
        matches!(self, Self::NotificationFailed { .. })
    }
}

/// Outcome of replaying spooled notifications.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedeliveryReport {
    /// Approval records of the cards sent, with a fresh approval window
    pub delivered: Vec<ApprovalRequest>,
    pub remaining: Vec<String>,
}

/// Request identifier: patch file name plus dispatch time in unix seconds.
#[must_use]
pub fn request_id(patch_file_name: &str, now: DateTime<Utc>) -> String {
    format!("{patch_file_name}-{}", now.timestamp())
}

/// Build card variables from any remediation proposal.
pub fn card_variables<P: RemediationProposal + ?Sized>(
    proposal: &P,
    request_id: &str,
) -> CardVariables {
    let operations = proposal.patch_operations();

    let mut patch = String::new();
    for op in operations {
        let _ = writeln!(patch, "{op}");
    }

    CardVariables {
        reason: proposal.reason().to_string(),
        patch: patch.trim_end().to_string(),
        patches: operations
            .iter()
            .map(|op| CardPatch {
                op: op.op.to_string(),
                path: op.path.clone(),
                value: op.value.clone().unwrap_or_default(),
            })
            .collect(),
        resolve_function: proposal.detail().to_string(),
        namespace: proposal.namespace().to_string(),
        kind: proposal.target_kind().to_string(),
        name: proposal.target_selector().to_string(),
        request_id: request_id.to_string(),
    }
}

/// Maps decisions to notifications.
pub struct ActionDispatcher {
    channel: Arc<dyn NotifyChannel>,
    settings: NotificationSettings,
    pending: Option<PendingStore>,
}

impl ActionDispatcher {
    #[must_use]
    pub fn new(channel: Arc<dyn NotifyChannel>, settings: NotificationSettings) -> Self {
        Self {
            channel,
            settings,
            pending: None,
        }
    }

    /// Spool undelivered proposals to `store`.
    #[must_use]
    pub fn with_pending_store(mut self, store: PendingStore) -> Self {
        self.pending = Some(store);
        self
    }

    /// Perform the side effect for `outcome`.
    pub async fn dispatch(
        &self,
        outcome: &DecisionOutcome,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        match outcome {
            DecisionOutcome::Noop(noop) => {
                info!(reason = %noop.reason, "No remediation needed");
                DispatchReport::Recorded {
                    reason: noop.reason.clone(),
                }
            }
            DecisionOutcome::Heal(heal) => self.dispatch_heal(heal, now, cancel).await,
        }
    }

    async fn dispatch_heal(
        &self,
        heal: &HealAction,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let request_id = request_id(heal.patch_file_name(), now);
        let variables = card_variables(heal, &request_id);
        let mut approval = ApprovalRequest {
            request_id: request_id.clone(),
            message_id: None,
            requested_at: now,
            expires_at: self.expiry(now),
            approved: false,
            approved_by: None,
            reason: heal.reason.clone(),
        };

        info!(
            request_id = %request_id,
            risk_level = %heal.risk_level,
            kind = %heal.target_kind(),
            selector = %heal.target_selector(),
            "Requesting approval for remediation"
        );

        match self.deliver(variables.clone(), cancel).await {
            Ok(message_id) => {
                approval.message_id = message_id;
                DispatchReport::Notified { approval }
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Approval card not delivered");
                let spooled = self
                    .spool(PendingNotification {
                        heal: heal.clone(),
                        variables,
                        approval: approval.clone(),
                        last_error: e.to_string(),
                        attempts: 1,
                    })
                    .await;
                DispatchReport::NotificationFailed {
                    approval,
                    error: e,
                    spooled,
                }
            }
        }
    }

    fn expiry(&self, requested_at: DateTime<Utc>) -> DateTime<Utc> {
        requested_at
            .checked_add_signed(self.settings.approval_timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn deliver(
        &self,
        variables: CardVariables,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, DeliveryError> {
        if !self.channel.enabled() {
            return Err(DeliveryError::NotConfigured(format!(
                "{} channel",
                self.channel.name()
            )));
        }

        let message = CardMessage::new(
            self.settings.receive_id.clone(),
            self.settings.receive_id_type,
            self.settings.template_id.clone(),
            self.settings.template_version.clone(),
            variables,
        );

        match guard::bounded(
            self.settings.delivery_timeout,
            cancel,
            self.channel.deliver(&message),
        )
        .await
        {
            Ok(result) => result.map(|receipt| receipt.message_id),
            Err(Interrupted::Timeout(d)) => Err(DeliveryError::Other(format!(
                "delivery timed out after {}s",
                d.as_secs()
            ))),
            Err(Interrupted::Cancelled) => {
                Err(DeliveryError::Other("delivery cancelled".to_string()))
            }
        }
    }

    async fn spool(&self, entry: PendingNotification) -> bool {
        let Some(store) = &self.pending else {
            return false;
        };
        match store.append(&entry).await {
            Ok(()) => {
                info!(
                    request_id = %entry.approval.request_id,
                    path = %store.path().display(),
                    "Spooled proposal for re-notification"
                );
                true
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to spool undelivered proposal");
                false
            }
        }
    }

    /// Re-send every spooled card. Delivered entries are removed from the store.
    ///
    /// A redelivered card opens a new approval window starting at `now`.
    pub async fn redeliver(
        &self,
        store: &PendingStore,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RedeliveryReport> {
        let snapshot = store.snapshot().await?;
        let mut report = RedeliveryReport::default();
        let mut remaining = Vec::new();

        for mut entry in snapshot.entries.iter().cloned() {
            let request_id = entry.approval.request_id.clone();
            if cancel.is_cancelled() {
                report.remaining.push(request_id);
                remaining.push(entry);
                continue;
            }
            match self.deliver(entry.variables.clone(), cancel).await {
                Ok(message_id) => {
                    info!(request_id = %request_id, "Redelivered approval card");
                    let mut approval = entry.approval;
                    approval.message_id = message_id;
                    approval.requested_at = now;
                    approval.expires_at = self.expiry(now);
                    report.delivered.push(approval);
                }
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Redelivery failed");
                    entry.attempts += 1;
                    entry.last_error = e.to_string();
                    report.remaining.push(request_id);
                    remaining.push(entry);
                }
            }
        }

        store.commit(&snapshot, &remaining).await?;
        Ok(report)
    }
}
