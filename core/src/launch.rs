//! Panel launch parameters taken from the query string:
//! `token`, `filas` (comma-separated) and the older single-queue `fila` /
//! `filaId`.

use crate::{PanelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::{form_urlencoded, Url};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub token: Option<String>,
    pub queues: Vec<String>,
}

/// Problems shown inline on the panel instead of failing start-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchWarning {
    MissingToken,
    MissingQueues,
}

impl fmt::Display for LaunchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchWarning::MissingToken => {
                write!(f, "Token de acesso ausente: informe ?token=... na URL do painel")
            }
            LaunchWarning::MissingQueues => {
                write!(f, "Nenhuma fila informada: use ?filas=1,2 ou ?fila=1")
            }
        }
    }
}

impl LaunchParams {
    /// Parses a raw query string, with or without the leading `?`.
    pub fn from_query(query: &str) -> Self {
        let query = query.trim().trim_start_matches('?');
        let mut token = None;
        let mut multi: Option<Vec<String>> = None;
        let mut single: Option<String> = None;

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            match &*key {
                "token" if !value.is_empty() => token = Some(value.to_string()),
                "filas" => {
                    let list = multi.get_or_insert_with(Vec::new);
                    list.extend(value.split(',').map(str::trim).map(str::to_string));
                }
                "fila" | "filaId" if single.is_none() && !value.is_empty() => {
                    single = Some(value.to_string())
                }
                _ => {}
            }
        }

        let mut queues = Vec::new();
        let candidates = match multi.filter(|l| l.iter().any(|q| !q.is_empty())) {
            Some(list) => list,
            None => single.into_iter().collect(),
        };
        for queue in candidates {
            if !queue.is_empty() && !queues.contains(&queue) {
                queues.push(queue);
            }
        }

        Self { token, queues }
    }

    /// Parses the query part of a full panel URL.
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| PanelError::ConfigError(format!("invalid panel url {}: {}", raw, e)))?;
        Ok(Self::from_query(url.query().unwrap_or("")))
    }

    pub fn warnings(&self) -> Vec<LaunchWarning> {
        let mut warnings = Vec::new();
        if self.token.is_none() {
            warnings.push(LaunchWarning::MissingToken);
        }
        if self.queues.is_empty() {
            warnings.push(LaunchWarning::MissingQueues);
        }
        warnings
    }
}
