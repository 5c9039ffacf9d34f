//! Inbound panel messages.
//!
//! Two JSON shapes arrive on a queue channel:
//! - snapshot: `{ chamadaAtual?, ultimasChamadas?, tempoExibicao?, sinalizacaoSonora?,
//!   mensagemVocalizacao?, repeticoes?, intervaloRepeticao? }`
//! - single call: `{ entradaFilaId, clienteNome, senha, filaId, filaNome, setorNome,
//!   guicheOuSalaAtendimento, timestamp }`
//!
//! Wire structs keep every field optional so that a missing field surfaces as a
//! validation error instead of a deserialization panic path.

use crate::model::{CallKey, CallRecord, MAX_PARAM_SECS, MAX_REPEAT_COUNT};
use crate::{PanelError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier that the backend may send as a JSON string or number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn as_text(&self) -> String {
        match self {
            WireId::Text(s) => s.trim().to_string(),
            WireId::Number(n) => n.to_string(),
        }
    }
}

/// Call entry inside a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCall {
    pub nome_paciente: Option<String>,
    pub guiche_ou_sala: Option<String>,
    pub data_hora_chamada: Option<String>,
}

impl SnapshotCall {
    pub fn to_record(&self, queue_id: &str) -> Result<CallRecord> {
        let name = required_text(self.nome_paciente.as_deref(), "nomePaciente")?;
        let raw_ts = required_text(self.data_hora_chamada.as_deref(), "dataHoraChamada")?;
        let timestamp = parse_timestamp(&raw_ts).ok_or_else(|| {
            PanelError::MalformedMessage(format!("unparseable dataHoraChamada: {}", raw_ts))
        })?;

        Ok(CallRecord {
            key: CallKey::origin(queue_id, timestamp),
            queue_id: queue_id.to_string(),
            subject_name: name,
            location: self
                .guiche_ou_sala
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            timestamp,
            is_new: false,
            ticket: None,
            queue_name: None,
            sector_name: None,
        })
    }
}

/// Batched panel state: current call plus recent history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub chamada_atual: Option<SnapshotCall>,
    #[serde(default)]
    pub ultimas_chamadas: Option<Vec<SnapshotCall>>,
    /// Highlight duration in seconds
    pub tempo_exibicao: Option<f64>,
    pub sinalizacao_sonora: Option<bool>,
    pub mensagem_vocalizacao: Option<String>,
    pub repeticoes: Option<i64>,
    /// Seconds between announcement repeats
    pub intervalo_repeticao: Option<f64>,
}

impl Snapshot {
    /// Validates every entry; one bad entry rejects the whole snapshot.
    pub fn to_records(&self, queue_id: &str) -> Result<(Option<CallRecord>, Vec<CallRecord>)> {
        let current = self
            .chamada_atual
            .as_ref()
            .map(|c| c.to_record(queue_id))
            .transpose()?;
        let recent = self
            .ultimas_chamadas
            .iter()
            .flatten()
            .map(|c| c.to_record(queue_id))
            .collect::<Result<Vec<_>>>()?;
        Ok((current, recent))
    }

    pub fn display_duration(&self) -> Option<Duration> {
        self.tempo_exibicao.and_then(seconds)
    }

    pub fn repeat_interval(&self) -> Option<Duration> {
        self.intervalo_repeticao.and_then(seconds)
    }

    pub fn repeat_count(&self) -> Option<u32> {
        self.repeticoes
            .filter(|n| *n >= 1)
            .map(|n| n.min(MAX_REPEAT_COUNT as i64) as u32)
    }

    /// Sound signalling is on unless explicitly disabled
    pub fn sound_enabled(&self) -> bool {
        self.sinalizacao_sonora.unwrap_or(true)
    }

    pub fn voice_template(&self) -> Option<&str> {
        self.mensagem_vocalizacao
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// One call event for a queue entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleCall {
    pub entrada_fila_id: Option<WireId>,
    pub cliente_nome: Option<String>,
    pub senha: Option<String>,
    pub fila_id: Option<WireId>,
    pub fila_nome: Option<String>,
    pub setor_nome: Option<String>,
    pub guiche_ou_sala_atendimento: Option<String>,
    pub timestamp: Option<String>,
}

impl SingleCall {
    pub fn to_record(&self, queue_id: &str) -> Result<CallRecord> {
        let entry_id = self
            .entrada_fila_id
            .as_ref()
            .map(WireId::as_text)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PanelError::MalformedMessage("missing entradaFilaId".into()))?;
        let name = required_text(self.cliente_nome.as_deref(), "clienteNome")?;
        let raw_ts = required_text(self.timestamp.as_deref(), "timestamp")?;
        let timestamp = parse_timestamp(&raw_ts).ok_or_else(|| {
            PanelError::MalformedMessage(format!("unparseable timestamp: {}", raw_ts))
        })?;

        Ok(CallRecord {
            key: CallKey::entry(entry_id),
            queue_id: self
                .fila_id
                .as_ref()
                .map(WireId::as_text)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| queue_id.to_string()),
            subject_name: name,
            location: optional_text(self.guiche_ou_sala_atendimento.as_deref())
                .unwrap_or_default(),
            timestamp,
            is_new: true,
            ticket: optional_text(self.senha.as_deref()),
            queue_name: optional_text(self.fila_nome.as_deref()),
            sector_name: optional_text(self.setor_nome.as_deref()),
        })
    }
}

/// Classified inbound update
#[derive(Debug, Clone, PartialEq)]
pub enum CallUpdate {
    Single(SingleCall),
    Snapshot(Snapshot),
}

impl CallUpdate {
    /// Classifies and decodes a raw JSON frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| PanelError::MalformedMessage("payload is not a JSON object".into()))?;

        if obj.contains_key("entradaFilaId") {
            let single: SingleCall = serde_json::from_value(value)?;
            return Ok(CallUpdate::Single(single));
        }
        if obj.contains_key("chamadaAtual") || obj.contains_key("ultimasChamadas") {
            let snapshot: Snapshot = serde_json::from_value(value)?;
            return Ok(CallUpdate::Snapshot(snapshot));
        }
        Err(PanelError::MalformedMessage(
            "neither a single call nor a panel snapshot".into(),
        ))
    }
}

/// Parses RFC 3339 or zone-less ISO local date-times (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Positive seconds, capped at `MAX_PARAM_SECS`
fn seconds(value: f64) -> Option<Duration> {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value.min(MAX_PARAM_SECS as f64)).ok()
    } else {
        None
    }
}

fn required_text(value: Option<&str>, field: &str) -> Result<String> {
    optional_text(value).ok_or_else(|| PanelError::MalformedMessage(format!("missing {}", field)))
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
