//! Batch ingestion: one analysis request per file, strictly in submission order,
//! with every per-file outcome reconciled into a canonical [`Scan`].
//!
//! Outcomes the analysis service can produce for a file:
//! * a scan with `success: true` is recorded as reported;
//! * a scan with `success: false` is recorded as reported, so the user sees the failure;
//! * no scan, a transport error, a rejected status or an undecodable body all lead to a
//!   synthesized `failed` record built from the uploaded file.
//!
//! Per-file problems never escape [`IngestionController::submit_batch`]. Only a batch-level
//! failure (oversized batch, full store) ends a batch early, and it is reported in the
//! returned [`BatchSummary`] rather than as an error.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    analysis::AnalysisService,
    error::{Result, ScanError},
    format::infer_format,
    models::{AnalysisStatus, AnalyzeResponse, FileBlob, Scan, ScanPayload},
    store::{ScanEvent, ScanStore},
};

/// Where an appended record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Backend reported success with a scan
    Reported,
    /// Backend reported failure but still described the scan
    ReportedFailure,
    /// Built locally because the backend response was unusable
    Synthesized,
}

/// A reconciled per-file outcome, ready to append
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub scan: Scan,
    pub origin: RecordOrigin,
    /// Why the record had to be synthesized
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub submitted: usize,
    /// Ids of the appended records, in submission order
    pub appended: Vec<String>,
    pub reported: usize,
    pub reported_failures: usize,
    pub synthesized: usize,
    pub outcome: BatchOutcome,
}

impl BatchSummary {
    fn new(batch_id: String, submitted: usize) -> Self {
        Self {
            batch_id,
            submitted,
            appended: Vec::with_capacity(submitted),
            reported: 0,
            reported_failures: 0,
            synthesized: 0,
            outcome: BatchOutcome::Completed,
        }
    }

    fn record(&mut self, id: String, origin: RecordOrigin) {
        self.appended.push(id);
        match origin {
            RecordOrigin::Reported => self.reported += 1,
            RecordOrigin::ReportedFailure => self.reported_failures += 1,
            RecordOrigin::Synthesized => self.synthesized += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionOptions {
    /// Largest accepted batch; `None` accepts any size
    pub max_batch_files: Option<usize>,
}

/// Marks a batch as in progress for as long as it is alive.
struct InProgress {
    active: Arc<watch::Sender<usize>>,
}

impl InProgress {
    fn enter(active: Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|count| *count += 1);
        Self { active }
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.active
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Owns a [`ScanStore`] and is the only writer to it.
///
/// Batches submitted while another one is running wait their turn, so records
/// of one batch are never interleaved with another's.
#[derive(Clone)]
pub struct IngestionController {
    service: Arc<dyn AnalysisService>,
    store: ScanStore,
    options: IngestionOptions,
    active: Arc<watch::Sender<usize>>,
    turn: Arc<Mutex<()>>,
}

impl IngestionController {
    pub fn new(service: Arc<dyn AnalysisService>, store: ScanStore) -> Self {
        Self::with_options(service, store, IngestionOptions::default())
    }

    pub fn with_options(
        service: Arc<dyn AnalysisService>,
        store: ScanStore,
        options: IngestionOptions,
    ) -> Self {
        let (active, _rx) = watch::channel(0usize);
        Self {
            service,
            store,
            options,
            active: Arc::new(active),
            turn: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    /// True while any batch is running or queued.
    pub fn is_analyzing(&self) -> bool {
        *self.active.borrow() > 0
    }

    /// Number of running plus queued batches, updated on every change.
    pub fn subscribe_active_batches(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }

    /// Analyse `files` one at a time and append one record per file.
    pub async fn submit_batch(&self, files: Vec<FileBlob>) -> BatchSummary {
        let _in_progress = InProgress::enter(self.active.clone());
        let _turn = self.turn.lock().await;

        let batch_id = Uuid::new_v4().to_string();
        let mut summary = BatchSummary::new(batch_id.clone(), files.len());
        info!(batch_id = %batch_id, files = files.len(), "Starting scan batch");

        if let Err(e) = self.run_batch(&files, &mut summary).await {
            error!(batch_id = %batch_id, "Scan batch ended early: {}", e);
            summary.outcome = BatchOutcome::Aborted {
                reason: e.to_string(),
            };
        }

        self.store.publish(ScanEvent::BatchFinished {
            batch_id: batch_id.clone(),
            appended: summary.appended.len(),
        });
        info!(
            batch_id = %batch_id,
            appended = summary.appended.len(),
            synthesized = summary.synthesized,
            "Scan batch finished"
        );

        summary
    }

    async fn run_batch(&self, files: &[FileBlob], summary: &mut BatchSummary) -> Result<()> {
        if let Some(limit) = self.options.max_batch_files {
            if files.len() > limit {
                return Err(ScanError::BatchTooLarge {
                    submitted: files.len(),
                    limit,
                });
            }
        }

        self.store.publish(ScanEvent::BatchStarted {
            batch_id: summary.batch_id.clone(),
            files: files.len(),
        });

        for (position, file) in files.iter().enumerate() {
            debug!("Analysing file {} of {}: {}", position + 1, files.len(), file.filename);

            let outcome = self.service.analyze(file).await;
            let reconciled = reconcile(file, outcome, |id| self.store.contains(id));

            match &reconciled.reason {
                Some(reason) => warn!(
                    filename = %file.filename,
                    scan_id = %reconciled.scan.id,
                    "Analysis unusable, recording failed scan: {}",
                    reason
                ),
                None => info!(
                    filename = %file.filename,
                    scan_id = %reconciled.scan.id,
                    status = reconciled.scan.analysis_status.as_str(),
                    "Recorded analysed scan"
                ),
            }

            let id = reconciled.scan.id.clone();
            self.store.append(reconciled.scan).await?;
            summary.record(id, reconciled.origin);
        }

        Ok(())
    }
}

/// Turn one analysis outcome into the record to append.
///
/// `is_taken` reports ids already present in the collection; a backend id that
/// collides makes the response unusable.
pub fn reconcile(
    file: &FileBlob,
    outcome: Result<AnalyzeResponse>,
    is_taken: impl Fn(&str) -> bool,
) -> Reconciled {
    let response = match outcome {
        Ok(response) => response,
        Err(e) => return synthesize(file, e.to_string(), &is_taken),
    };

    let Some(payload) = response.scan else {
        let reason = response
            .error
            .unwrap_or_else(|| "Analysis response contained no scan".to_string());
        return synthesize(file, reason, &is_taken);
    };

    let origin = if response.success {
        RecordOrigin::Reported
    } else {
        RecordOrigin::ReportedFailure
    };

    let scan = from_payload(payload, file);
    if is_taken(&scan.id) {
        return synthesize(
            file,
            format!("Analysis service reused scan id {}", scan.id),
            &is_taken,
        );
    }
    if !scan.is_consistent() {
        warn!(
            scan_id = %scan.id,
            status = scan.analysis_status.as_str(),
            "Reported scan has an inconsistent status and result"
        );
    }

    Reconciled {
        scan,
        origin,
        reason: None,
    }
}

/// Adopt a backend record, filling in what the backend left unset.
fn from_payload(payload: ScanPayload, file: &FileBlob) -> Scan {
    let id = payload
        .id
        .or_else(|| {
            payload
                .analysis_result
                .as_ref()
                .map(|result| result.scan_id.clone())
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let format = payload
        .format
        .unwrap_or_else(|| infer_format(&file.filename, &file.content_type));

    Scan {
        id,
        filename: payload.filename,
        uploaded_at: payload.uploaded_at,
        thumbnail_url: payload.thumbnail_url,
        full_image_url: payload.full_image_url,
        format,
        size: payload.size,
        analysis_status: payload.analysis_status,
        analysis_result: payload.analysis_result,
    }
}

fn synthesize(file: &FileBlob, reason: String, is_taken: &impl Fn(&str) -> bool) -> Reconciled {
    let id = loop {
        let candidate = Uuid::new_v4().to_string();
        if !is_taken(&candidate) {
            break candidate;
        }
    };

    Reconciled {
        scan: Scan {
            id,
            filename: file.filename.clone(),
            uploaded_at: Utc::now(),
            thumbnail_url: String::new(),
            full_image_url: String::new(),
            format: infer_format(&file.filename, &file.content_type),
            size: file.size(),
            analysis_status: AnalysisStatus::Failed,
            analysis_result: None,
        },
        origin: RecordOrigin::Synthesized,
        reason: Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanFormat;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Notify;

    enum Reply {
        Body(Value),
        NetworkError,
    }

    /// Answers by filename; unknown files get a network error.
    struct ScriptedAnalysisService {
        replies: HashMap<String, Reply>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedAnalysisService {
        fn new(replies: Vec<(&str, Reply)>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|(name, reply)| (name.to_string(), reply))
                    .collect(),
                gate: None,
            }
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl AnalysisService for ScriptedAnalysisService {
        async fn analyze(&self, file: &FileBlob) -> Result<AnalyzeResponse> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.replies.get(&file.filename) {
                Some(Reply::Body(body)) => serde_json::from_value(body.clone())
                    .map_err(|e| ScanError::MalformedResponse(e.to_string())),
                Some(Reply::NetworkError) | None => {
                    Err(ScanError::Transport("connection reset by peer".to_string()))
                }
            }
        }
    }

    fn completed_body(id: &str, filename: &str, confidence: f64) -> Value {
        json!({
            "success": true,
            "scan": {
                "id": id,
                "filename": filename,
                "uploadedAt": "2024-06-01T12:00:00Z",
                "thumbnailUrl": format!("/thumbs/{}.png", id),
                "fullImageUrl": format!("/images/{}.png", id),
                "format": "PNG",
                "size": 1024,
                "analysisStatus": "completed",
                "analysisResult": {
                    "id": format!("result-{}", id),
                    "scanId": id,
                    "timestamp": "2024-06-01T12:01:00Z",
                    "findings": {
                        "summary": "Unremarkable study.",
                        "anatomy": [],
                        "abnormalities": [],
                        "recommendations": []
                    },
                    "confidence": confidence
                }
            }
        })
    }

    fn controller(service: ScriptedAnalysisService) -> IngestionController {
        IngestionController::new(Arc::new(service), ScanStore::new())
    }

    #[tokio::test]
    async fn test_success_then_network_failure() {
        let controller = controller(ScriptedAnalysisService::new(vec![
            ("a.png", Reply::Body(completed_body("scan-a", "a.png", 0.87))),
            ("b.dcm", Reply::NetworkError),
        ]));

        let summary = controller
            .submit_batch(vec![
                FileBlob::new("a.png", "image/png", vec![0u8; 1024]),
                FileBlob::new("b.dcm", "application/dicom", vec![0u8; 333]),
            ])
            .await;

        let scans = controller.store().snapshot().await;
        assert_eq!(scans.len(), 2);

        assert_eq!(scans[0].id, "scan-a");
        assert_eq!(scans[0].analysis_status, AnalysisStatus::Completed);
        assert_eq!(scans[0].analysis_result.as_ref().unwrap().confidence, 0.87);

        assert_eq!(scans[1].filename, "b.dcm");
        assert_eq!(scans[1].analysis_status, AnalysisStatus::Failed);
        assert_eq!(scans[1].size, 333);
        assert_eq!(scans[1].format, ScanFormat::Dicom);
        assert!(scans[1].analysis_result.is_none());
        assert!(scans[1].thumbnail_url.is_empty());
        assert_ne!(scans[1].id, scans[0].id);

        assert_eq!(summary.appended, vec![scans[0].id.clone(), scans[1].id.clone()]);
        assert_eq!(summary.reported, 1);
        assert_eq!(summary.synthesized, 1);
        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert!(!controller.is_analyzing());
    }

    #[tokio::test]
    async fn test_reported_failure_is_recorded_unchanged() {
        let body = json!({
            "success": false,
            "error": "Model could not read the image",
            "scan": {
                "id": "scan-f",
                "filename": "f.jpg",
                "uploadedAt": "2024-06-01T12:00:00Z",
                "thumbnailUrl": "/thumbs/scan-f.png",
                "fullImageUrl": "",
                "format": "JPG",
                "size": 42,
                "analysisStatus": "failed"
            }
        });
        let controller = controller(ScriptedAnalysisService::new(vec![(
            "f.jpg",
            Reply::Body(body),
        )]));

        let summary = controller
            .submit_batch(vec![FileBlob::new("f.jpg", "image/jpeg", vec![1u8; 9])])
            .await;

        let scan = controller.store().get("scan-f").await.unwrap();
        assert_eq!(scan.thumbnail_url, "/thumbs/scan-f.png");
        // size comes from the record, not the upload
        assert_eq!(scan.size, 42);
        assert_eq!(scan.analysis_status, AnalysisStatus::Failed);
        assert_eq!(summary.reported_failures, 1);
        assert_eq!(summary.synthesized, 0);
    }

    #[tokio::test]
    async fn test_response_without_scan_is_synthesized() {
        let controller = controller(ScriptedAnalysisService::new(vec![(
            "c.png",
            Reply::Body(json!({ "success": true })),
        )]));

        controller
            .submit_batch(vec![FileBlob::new("c.png", "image/png", vec![0u8; 12])])
            .await;

        let scan = controller.store().last().await.unwrap();
        assert_eq!(scan.analysis_status, AnalysisStatus::Failed);
        assert_eq!(scan.format, ScanFormat::Png);
        assert_eq!(scan.size, 12);
    }

    #[tokio::test]
    async fn test_every_file_failing_still_records_each() {
        let controller = controller(ScriptedAnalysisService::new(vec![]));
        let files: Vec<_> = (0..5)
            .map(|i| FileBlob::new(format!("slice_{}.jpg", i), "image/jpeg", vec![0u8; i]))
            .collect();

        let summary = controller.submit_batch(files).await;

        let scans = controller.store().snapshot().await;
        assert_eq!(scans.len(), 5);
        for (i, scan) in scans.iter().enumerate() {
            assert_eq!(scan.filename, format!("slice_{}.jpg", i));
            assert_eq!(scan.size, i as u64);
            assert_eq!(scan.analysis_status, AnalysisStatus::Failed);
        }
        let mut ids: Vec<_> = scans.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert_eq!(summary.synthesized, 5);
        assert!(!controller.is_analyzing());
    }

    #[tokio::test]
    async fn test_missing_id_and_format_are_filled_in() {
        let mut body = completed_body("scan-x", "x.dcm", 0.5);
        body["scan"].as_object_mut().unwrap().remove("id");
        body["scan"].as_object_mut().unwrap().remove("format");
        let controller = controller(ScriptedAnalysisService::new(vec![(
            "x.dcm",
            Reply::Body(body),
        )]));

        controller
            .submit_batch(vec![FileBlob::new("x.dcm", "", vec![0u8; 4])])
            .await;

        let scan = controller.store().last().await.unwrap();
        assert_eq!(scan.id, "scan-x");
        assert_eq!(scan.format, ScanFormat::Dicom);
        assert!(scan.is_consistent());
    }

    #[tokio::test]
    async fn test_reused_backend_id_is_synthesized() {
        let controller = controller(ScriptedAnalysisService::new(vec![
            ("one.png", Reply::Body(completed_body("same", "one.png", 0.9))),
            ("two.png", Reply::Body(completed_body("same", "two.png", 0.9))),
        ]));

        let summary = controller
            .submit_batch(vec![
                FileBlob::new("one.png", "image/png", vec![0u8; 1]),
                FileBlob::new("two.png", "image/png", vec![0u8; 2]),
            ])
            .await;

        let scans = controller.store().snapshot().await;
        assert_eq!(scans[0].id, "same");
        assert_ne!(scans[1].id, "same");
        assert_eq!(scans[1].analysis_status, AnalysisStatus::Failed);
        assert_eq!(summary.synthesized, 1);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_rejected() {
        let controller = IngestionController::with_options(
            Arc::new(ScriptedAnalysisService::new(vec![])),
            ScanStore::new(),
            IngestionOptions {
                max_batch_files: Some(1),
            },
        );

        let summary = controller
            .submit_batch(vec![
                FileBlob::new("a.jpg", "", vec![]),
                FileBlob::new("b.jpg", "", vec![]),
            ])
            .await;

        assert!(matches!(summary.outcome, BatchOutcome::Aborted { .. }));
        assert!(summary.appended.is_empty());
        assert!(controller.store().is_empty().await);
        assert!(!controller.is_analyzing());
    }

    #[tokio::test]
    async fn test_full_store_ends_batch_early() {
        let controller = IngestionController::new(
            Arc::new(ScriptedAnalysisService::new(vec![])),
            ScanStore::with_limits(Some(2), 16),
        );

        let summary = controller
            .submit_batch(
                (0..4)
                    .map(|i| FileBlob::new(format!("{}.jpg", i), "", vec![]))
                    .collect(),
            )
            .await;

        assert_eq!(summary.appended.len(), 2);
        assert!(matches!(
            summary.outcome,
            BatchOutcome::Aborted { ref reason } if reason.contains("full")
        ));
        assert_eq!(controller.store().len().await, 2);
        assert!(!controller.is_analyzing());
    }

    #[tokio::test]
    async fn test_flag_held_across_queued_batches() {
        let gate = Arc::new(Notify::new());
        let controller = controller(
            ScriptedAnalysisService::new(vec![
                ("first.png", Reply::Body(completed_body("first", "first.png", 0.7))),
                ("second.png", Reply::Body(completed_body("second", "second.png", 0.7))),
                ("third.png", Reply::Body(completed_body("third", "third.png", 0.7))),
            ])
            .gated(gate.clone()),
        );
        let mut active = controller.subscribe_active_batches();

        let first = tokio::spawn({
            let controller = controller.clone();
            async move {
                controller
                    .submit_batch(vec![
                        FileBlob::new("first.png", "image/png", vec![]),
                        FileBlob::new("second.png", "image/png", vec![]),
                    ])
                    .await
            }
        });
        active.wait_for(|count| *count == 1).await.unwrap();

        let second = tokio::spawn({
            let controller = controller.clone();
            async move {
                controller
                    .submit_batch(vec![FileBlob::new("third.png", "image/png", vec![])])
                    .await
            }
        });
        active.wait_for(|count| *count == 2).await.unwrap();
        assert!(controller.is_analyzing());

        // release one request at a time until both batches settle
        while !first.is_finished() || !second.is_finished() {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !first.is_finished() || !second.is_finished() {
                assert!(controller.is_analyzing());
            }
        }

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first.appended, vec!["first", "second"]);
        assert_eq!(second.appended, vec!["third"]);

        let ids: Vec<_> = controller
            .store()
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert!(!controller.is_analyzing());
    }

    #[tokio::test]
    async fn test_batch_events_are_published() {
        let controller = controller(ScriptedAnalysisService::new(vec![(
            "a.png",
            Reply::Body(completed_body("scan-a", "a.png", 0.87)),
        )]));
        let mut events = controller.store().subscribe();

        controller
            .submit_batch(vec![
                FileBlob::new("a.png", "image/png", vec![]),
                FileBlob::new("b.png", "image/png", vec![]),
            ])
            .await;

        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::BatchStarted { files: 2, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::ScanAppended { index: 0, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::ScanAppended { index: 1, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::BatchFinished { appended: 2, .. }
        ));
    }

    #[test]
    fn test_reconcile_prefers_backend_error_message() {
        let file = FileBlob::new("q.jpg", "image/jpeg", vec![0u8; 3]);
        let reconciled = reconcile(
            &file,
            Ok(AnalyzeResponse {
                success: false,
                scan: None,
                error: Some("quota exceeded".to_string()),
            }),
            |_| false,
        );

        assert_eq!(reconciled.origin, RecordOrigin::Synthesized);
        assert_eq!(reconciled.reason.as_deref(), Some("quota exceeded"));
        assert_eq!(reconciled.scan.format, ScanFormat::Jpg);
    }

    #[tokio::test]
    async fn test_inconsistent_record_is_kept_as_received() {
        let body = json!({
            "success": true,
            "scan": {
                "id": "scan-x",
                "filename": "x.png",
                "uploadedAt": "2024-06-01T12:00:00Z",
                "thumbnailUrl": "/thumbs/scan-x.png",
                "fullImageUrl": "/images/scan-x.png",
                "format": "PNG",
                "size": 77,
                "analysisStatus": "completed"
            }
        });
        let file = FileBlob::new("x.png", "image/png", vec![0u8; 5]);
        let response: AnalyzeResponse = serde_json::from_value(body.clone()).unwrap();

        let reconciled = reconcile(&file, Ok(response), |_| false);
        assert_eq!(reconciled.origin, RecordOrigin::Reported);
        assert!(reconciled.reason.is_none());
        assert!(!reconciled.scan.is_consistent());

        let controller = controller(ScriptedAnalysisService::new(vec![(
            "x.png",
            Reply::Body(body),
        )]));
        let summary = controller.submit_batch(vec![file]).await;

        let scan = controller.store().get("scan-x").await.unwrap();
        assert_eq!(scan.analysis_status, AnalysisStatus::Completed);
        assert!(scan.analysis_result.is_none());
        assert_eq!(scan.size, 77);
        assert_eq!(scan.thumbnail_url, "/thumbs/scan-x.png");
        assert_eq!(summary.reported, 1);
        assert_eq!(summary.synthesized, 0);
        assert_eq!(summary.appended, vec!["scan-x".to_string()]);
    }
}
