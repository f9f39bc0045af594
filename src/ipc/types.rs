use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::engine::SelectionSeq;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Generation counter shared by report requests; a new report for a
    /// different selection invalidates batches still in flight.
    pub selection: SelectionSeq,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            selection: SelectionSeq::default(),
        }
    }
}
