use scan_flow::{ChatSession, ChatTarget, Scan, Theme};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    #[serde(default)]
    pub theme: Option<Theme>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectScanRequest {
    pub scan_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThemeRequest {
    pub theme: Theme,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResponse {
    pub workspace_id: String,
    pub theme: Theme,
    pub analyzing: bool,
    pub scans: Vec<Scan>,
    pub selected_scan_id: Option<String>,
    pub chat_open: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStateResponse {
    pub open: bool,
    pub target: Option<ChatTarget>,
    pub session: Option<ChatSession>,
}
