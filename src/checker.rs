use crate::channels::ChannelSender;
use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::evaluator::{Evaluation, StatusEvaluator};
use crate::maintenance::MaintenanceGate;
use crate::models::{NotificationHistory, NotifyEvent};
use crate::notifications::NotificationEngine;
use crate::probe::{ProbeExecutor, ProbeResult};
use crate::recorder::{HistoryRecorder, RecordedCheck};
use crate::sse::{self, EngineEvent, EventBroadcaster};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Everything one check needs, shared by all scheduled tasks.
pub struct CheckContext {
    pub db: Arc<Db>,
    pub prober: ProbeExecutor,
    pub evaluator: StatusEvaluator,
    pub recorder: HistoryRecorder,
    pub notifier: Arc<NotificationEngine>,
    pub broadcaster: Arc<EventBroadcaster>,
}

impl CheckContext {
    pub fn new(
        db: Arc<Db>,
        config: &EngineConfig,
        sender: Arc<dyn ChannelSender>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Result<Self> {
        let notifier = Arc::new(NotificationEngine::new(
            db.clone(),
            MaintenanceGate::new(db.clone()),
            sender,
            broadcaster.clone(),
        ));
        Ok(CheckContext {
            prober: ProbeExecutor::new(config)?,
            evaluator: StatusEvaluator::from_config(config),
            recorder: HistoryRecorder::new(db.clone()),
            notifier,
            broadcaster,
            db,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub service_id: String,
    pub probe: ProbeResult,
    pub evaluation: Evaluation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_event: Option<NotifyEvent>,
    pub recorded: RecordedCheck,
    pub notifications: Vec<NotificationHistory>,
}

/// Probe, evaluate, record, then notify, for one service.
///
/// The service is reloaded first so edits made since scheduling apply. A
/// service that is gone, paused or deleted yields `NotFound`. If recording
/// fails the result is dropped and no notifications are sent.
pub async fn run_check(ctx: &CheckContext, service_id: &str) -> Result<CheckReport> {
    let service = ctx
        .db
        .get_service(service_id)?
        .filter(|s| s.is_active && !s.is_deleted)
        .ok_or_else(|| Error::not_found(format!("active service {}", service_id)))?;

    let probe = ctx.prober.probe(&service).await;
    let evaluation = ctx.evaluator.evaluate(service.status, &probe);
    let checked_at = Utc::now();

    let recorded = ctx
        .recorder
        .record(&service, &evaluation, &probe, checked_at)
        .map_err(|e| match e {
            Error::NotFound(_) => e,
            other => Error::Persistence(format!("check result for {} dropped: {}", service.id, other)),
        })?;

    debug!(
        service_id = %service.id,
        status = %evaluation.status,
        response_time = ?evaluation.response_time,
        "check completed"
    );
    ctx.broadcaster.send(EngineEvent::new(
        sse::CHECK_COMPLETED,
        Some(&service.id),
        serde_json::json!({
            "status": evaluation.status,
            "response_time": evaluation.response_time,
            "message": evaluation.message,
            "uptime": recorded.uptime,
            "checked_at": checked_at,
        }),
    ));
    if evaluation.transitioned {
        info!(
            service_id = %service.id,
            service = %service.name,
            from = %evaluation.previous,
            to = %evaluation.status,
            "status changed"
        );
        ctx.broadcaster.send(EngineEvent::new(
            sse::STATUS_CHANGED,
            Some(&service.id),
            serde_json::json!({
                "previous": evaluation.previous,
                "status": evaluation.status,
                "message": evaluation.message,
            }),
        ));
    }

    let ssl_event = ctx.evaluator.ssl_event(probe.ssl.as_ref().map(|c| c.days_remaining));
    let mut notified_service = service;
    if let Some(cert) = &probe.ssl {
        notified_service.ssl_expiry_date = Some(cert.expires_at);
        notified_service.ssl_days_remaining = Some(cert.days_remaining);
    }
    let notifications = match ctx
        .notifier
        .handle_check(&notified_service, &evaluation, ssl_event, checked_at)
        .await
    {
        Ok(sent) => sent,
        Err(e) => {
            error!(service_id = %notified_service.id, "notification evaluation failed: {}", e);
            Vec::new()
        }
    };

    Ok(CheckReport {
        service_id: notified_service.id,
        probe,
        evaluation,
        ssl_event,
        recorded,
        notifications,
    })
}
