use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::{Result, ScanError},
    models::{AnalysisResult, AnalysisStatus, Scan},
    store::ScanStore,
};

pub const REPORT_NOT_AVAILABLE: &str = "PDF report generation would be implemented here";

/// Scan the chat panel is talking about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTarget {
    pub scan_id: String,
    pub filename: String,
}

/// What the detail view should show for the current selection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum DetailView {
    NoSelection,
    Results {
        filename: String,
        result: AnalysisResult,
    },
    Status {
        filename: String,
        status: AnalysisStatus,
        message: String,
    },
}

impl DetailView {
    pub fn for_scan(scan: &Scan) -> Self {
        match (&scan.analysis_result, scan.analysis_status) {
            (Some(result), _) => DetailView::Results {
                filename: scan.filename.clone(),
                result: result.clone(),
            },
            (None, status) => DetailView::Status {
                filename: scan.filename.clone(),
                status,
                message: status_message(status).to_string(),
            },
        }
    }
}

fn status_message(status: AnalysisStatus) -> &'static str {
    match status {
        AnalysisStatus::Failed => "Analysis failed. Please try uploading again.",
        AnalysisStatus::Analyzing => "Analysis in progress...",
        _ => "No analysis results available for this scan.",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportNotice {
    pub scan_id: String,
    pub message: String,
}

/// Tracks the selected scan and whether the chat panel is open.
///
/// The selection is a scan id looked up in the store on demand; the
/// coordinator never modifies scan records.
#[derive(Clone)]
pub struct SelectionCoordinator {
    store: ScanStore,
    selected: Option<String>,
    chat_open: bool,
}

impl SelectionCoordinator {
    pub fn new(store: ScanStore) -> Self {
        Self {
            store,
            selected: None,
            chat_open: false,
        }
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_chat_open(&self) -> bool {
        self.chat_open
    }

    pub async fn selected_scan(&self) -> Option<Scan> {
        match &self.selected {
            Some(id) => self.store.get(id).await,
            None => None,
        }
    }

    pub fn select(&mut self, scan_id: &str) -> Result<()> {
        if !self.store.contains(scan_id) {
            return Err(ScanError::ScanNotFound(scan_id.to_string()));
        }
        debug!("Selected scan {}", scan_id);
        self.selected = Some(scan_id.to_string());
        Ok(())
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Open chat for the scan that is already selected.
    pub async fn open_chat(&mut self) -> Result<ChatTarget> {
        let scan = self.selected_scan().await.ok_or(ScanError::NoSelection)?;
        self.chat_open = true;
        Ok(target_of(&scan))
    }

    /// Open chat from the floating button. Falls back to the most recent scan
    /// when nothing is selected; with no scans at all chat opens without context.
    pub async fn open_chat_floating(&mut self) -> Option<ChatTarget> {
        if self.selected.is_none() {
            if let Some(latest) = self.store.last().await {
                info!("Chat opened without a selection, using latest scan {}", latest.id);
                self.selected = Some(latest.id);
            }
        }
        self.chat_open = true;
        self.selected_scan().await.map(|scan| target_of(&scan))
    }

    /// Close the chat panel; the selection stays.
    pub fn close_chat(&mut self) {
        self.chat_open = false;
    }

    pub async fn detail_view(&self) -> DetailView {
        match self.selected_scan().await {
            Some(scan) => DetailView::for_scan(&scan),
            None => DetailView::NoSelection,
        }
    }

    /// Report generation is not available; returns the notice to show, or
    /// nothing when no scan is selected.
    pub async fn request_report(&self) -> Option<ReportNotice> {
        let scan = self.selected_scan().await?;
        info!("Report requested for scan {}", scan.id);
        Some(ReportNotice {
            scan_id: scan.id,
            message: REPORT_NOT_AVAILABLE.to_string(),
        })
    }
}

fn target_of(scan: &Scan) -> ChatTarget {
    ChatTarget {
        scan_id: scan.id.clone(),
        filename: scan.filename.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::AnalysisService,
        ingest::IngestionController,
        models::{AnalyzeResponse, FileBlob},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    struct OfflineAnalysisService;

    #[async_trait]
    impl AnalysisService for OfflineAnalysisService {
        async fn analyze(&self, _file: &FileBlob) -> Result<AnalyzeResponse> {
            Err(ScanError::Transport("offline".to_string()))
        }
    }

    async fn store_with(filenames: &[&str]) -> ScanStore {
        let store = ScanStore::new();
        let controller = IngestionController::new(Arc::new(OfflineAnalysisService), store.clone());
        controller
            .submit_batch(
                filenames
                    .iter()
                    .map(|name| FileBlob::new(*name, "image/jpeg", vec![0u8; 8]))
                    .collect(),
            )
            .await;
        store
    }

    #[tokio::test]
    async fn test_floating_chat_with_no_scans() {
        let mut coordinator = SelectionCoordinator::new(ScanStore::new());

        let target = coordinator.open_chat_floating().await;

        assert!(target.is_none());
        assert!(coordinator.selected_id().is_none());
        assert!(coordinator.is_chat_open());
    }

    #[tokio::test]
    async fn test_floating_chat_selects_latest_scan() {
        let store = store_with(&["first.jpg", "second.jpg"]).await;
        let latest = store.last().await.unwrap();
        let mut coordinator = SelectionCoordinator::new(store);

        let target = coordinator.open_chat_floating().await.unwrap();

        assert_eq!(target.scan_id, latest.id);
        assert_eq!(target.filename, "second.jpg");
        assert_eq!(coordinator.selected_id(), Some(latest.id.as_str()));
    }

    #[tokio::test]
    async fn test_floating_chat_keeps_existing_selection() {
        let store = store_with(&["first.jpg", "second.jpg"]).await;
        let first = store.snapshot().await[0].clone();
        let mut coordinator = SelectionCoordinator::new(store);
        coordinator.select(&first.id).unwrap();

        let target = coordinator.open_chat_floating().await.unwrap();

        assert_eq!(target.scan_id, first.id);
    }

    #[tokio::test]
    async fn test_open_chat_requires_selection() {
        let store = store_with(&["only.jpg"]).await;
        let only = store.last().await.unwrap();
        let mut coordinator = SelectionCoordinator::new(store);

        assert!(matches!(
            coordinator.open_chat().await,
            Err(ScanError::NoSelection)
        ));
        assert!(!coordinator.is_chat_open());

        coordinator.select(&only.id).unwrap();
        let target = coordinator.open_chat().await.unwrap();
        assert_eq!(target.scan_id, only.id);
        assert!(coordinator.is_chat_open());

        coordinator.close_chat();
        assert!(!coordinator.is_chat_open());
        assert_eq!(coordinator.selected_id(), Some(only.id.as_str()));
    }

    #[tokio::test]
    async fn test_select_unknown_scan() {
        let mut coordinator = SelectionCoordinator::new(ScanStore::new());
        assert!(matches!(
            coordinator.select("nope"),
            Err(ScanError::ScanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_detail_view_for_failed_scan() {
        let store = store_with(&["broken.jpg"]).await;
        let scan = store.last().await.unwrap();
        let mut coordinator = SelectionCoordinator::new(store);

        assert_eq!(coordinator.detail_view().await, DetailView::NoSelection);

        coordinator.select(&scan.id).unwrap();
        match coordinator.detail_view().await {
            DetailView::Status {
                status, message, ..
            } => {
                assert_eq!(status, AnalysisStatus::Failed);
                assert_eq!(message, "Analysis failed. Please try uploading again.");
            }
            other => panic!("unexpected view: {:?}", other),
        }

        coordinator.deselect();
        assert_eq!(coordinator.detail_view().await, DetailView::NoSelection);
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(
            status_message(AnalysisStatus::Analyzing),
            "Analysis in progress..."
        );
        assert_eq!(
            status_message(AnalysisStatus::Pending),
            "No analysis results available for this scan."
        );
    }

    #[tokio::test]
    async fn test_report_is_a_notice() {
        let store = store_with(&["r.jpg"]).await;
        let scan = store.last().await.unwrap();
        let mut coordinator = SelectionCoordinator::new(store);

        assert!(coordinator.request_report().await.is_none());

        coordinator.select(&scan.id).unwrap();
        let notice = coordinator.request_report().await.unwrap();
        assert_eq!(notice.scan_id, scan.id);
        assert_eq!(notice.message, REPORT_NOT_AVAILABLE);
    }
}
