use std::path::PathBuf;

use crate::access::RequestContext;
use crate::error::OrganizerError;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn ctx(&self) -> RequestContext {
        RequestContext::from_params(&self.params)
    }

    pub fn i64_param(&self, key: &str) -> Result<i64, OrganizerError> {
        self.params
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| OrganizerError::BadParams(format!("missing {}", key)))
    }

    pub fn opt_i64_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.as_i64())
    }

    pub fn ids_param(&self, key: &str) -> Result<Vec<i64>, OrganizerError> {
        let arr = self
            .params
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| OrganizerError::BadParams(format!("{} must be an array", key)))?;
        arr.iter()
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| OrganizerError::BadParams(format!("{} must hold integers", key)))
            })
            .collect()
    }
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
