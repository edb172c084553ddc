use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Image container formats the analysis pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanFormat {
    #[serde(rename = "DICOM")]
    Dicom,
    #[serde(rename = "JPG", alias = "JPEG")]
    Jpg,
    #[serde(rename = "PNG")]
    Png,
}

/// Lifecycle of a scan's analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

/// One uploaded image and its analysis lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    pub id: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub full_image_url: String,
    pub format: ScanFormat,
    pub size: u64,
    pub analysis_status: AnalysisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<AnalysisResult>,
}

impl Scan {
    /// A result is present exactly when the analysis completed, and it points back at this scan.
    pub fn is_consistent(&self) -> bool {
        let status_matches = (self.analysis_status == AnalysisStatus::Completed)
            == self.analysis_result.is_some();
        let back_reference_matches = self
            .analysis_result
            .as_ref()
            .is_none_or(|result| result.scan_id == self.id);
        status_matches && back_reference_matches
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    pub scan_id: String,
    pub timestamp: DateTime<Utc>,
    pub findings: Findings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Segmentation>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Findings {
    pub summary: String,
    #[serde(default)]
    pub anatomy: Vec<AnatomySection>,
    #[serde(default)]
    pub abnormalities: Vec<Finding>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnatomySection {
    pub name: String,
    pub description: String,
    pub normal_findings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingType {
    Normal,
    Abnormal,
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub location: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segmentation {
    pub overlay_url: String,
    #[serde(default)]
    pub regions: Vec<SegmentedRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentedRegion {
    pub id: String,
    pub name: String,
    pub color: String,
    pub coordinates: Vec<Vec<f64>>,
}

/// A file selected by the user, as handed to a batch
#[derive(Debug, Clone)]
pub struct FileBlob {
    pub filename: String,
    /// Declared MIME type, empty when the client did not send one
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FileBlob {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Scan record as the analysis backend reports it. The backend may leave the id
/// and the format for the client to fill in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub full_image_url: String,
    #[serde(default)]
    pub format: Option<ScanFormat>,
    pub size: u64,
    pub analysis_status: AnalysisStatus,
    #[serde(default)]
    pub analysis_result: Option<AnalysisResult>,
}

/// Response envelope of the analysis endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    #[serde(default)]
    pub scan: Option<ScanPayload>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_dates_are_parsed() {
        let body = json!({
            "success": true,
            "scan": {
                "id": "scan-1",
                "filename": "brain.dcm",
                "uploadedAt": "2024-03-01T10:15:00.000Z",
                "thumbnailUrl": "/thumbs/scan-1.png",
                "fullImageUrl": "/images/scan-1.png",
                "format": "DICOM",
                "size": 2048,
                "analysisStatus": "completed",
                "analysisResult": {
                    "id": "result-1",
                    "scanId": "scan-1",
                    "timestamp": "2024-03-01T10:16:30Z",
                    "findings": {
                        "summary": "No acute intracranial abnormality.",
                        "anatomy": [
                            { "name": "Ventricles", "description": "Normal size", "normalFindings": true }
                        ],
                        "abnormalities": [
                            { "type": "uncertain", "location": "Left frontal lobe", "description": "Small T2 hyperintensity", "severity": "mild" }
                        ],
                        "recommendations": ["Follow-up MRI in 6 months"]
                    },
                    "segmentation": {
                        "overlayUrl": "/overlays/scan-1.png",
                        "regions": [
                            { "id": "r1", "name": "Lesion", "color": "#ff0000", "coordinates": [[1.0, 2.0], [3.0, 4.0]] }
                        ]
                    },
                    "confidence": 0.87
                }
            }
        });

        let response: AnalyzeResponse = serde_json::from_value(body).unwrap();
        let scan = response.scan.unwrap();
        assert_eq!(scan.uploaded_at.to_rfc3339(), "2024-03-01T10:15:00+00:00");

        let result = scan.analysis_result.unwrap();
        assert_eq!(result.timestamp.to_rfc3339(), "2024-03-01T10:16:30+00:00");
        assert_eq!(result.findings.abnormalities[0].finding_type, FindingType::Uncertain);
        assert_eq!(result.findings.abnormalities[0].severity, Some(Severity::Mild));
        assert_eq!(result.segmentation.unwrap().regions[0].coordinates.len(), 2);
    }

    #[test]
    fn test_unparseable_date_is_rejected() {
        let body = json!({
            "success": true,
            "scan": {
                "filename": "brain.png",
                "uploadedAt": "yesterday",
                "size": 10,
                "analysisStatus": "pending"
            }
        });

        assert!(serde_json::from_value::<AnalyzeResponse>(body).is_err());
    }

    #[test]
    fn test_scan_serializes_camel_case() {
        let scan = Scan {
            id: "abc".to_string(),
            filename: "knee.jpg".to_string(),
            uploaded_at: Utc::now(),
            thumbnail_url: String::new(),
            full_image_url: String::new(),
            format: ScanFormat::Jpg,
            size: 5,
            analysis_status: AnalysisStatus::Failed,
            analysis_result: None,
        };

        let value = serde_json::to_value(&scan).unwrap();
        assert_eq!(value["analysisStatus"], "failed");
        assert_eq!(value["format"], "JPG");
        assert!(value.get("analysisResult").is_none());
        assert!(scan.is_consistent());
    }

    #[test]
    fn test_jpeg_alias() {
        let format: ScanFormat = serde_json::from_value(json!("JPEG")).unwrap();
        assert_eq!(format, ScanFormat::Jpg);
    }
}
