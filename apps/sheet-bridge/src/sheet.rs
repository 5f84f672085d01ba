//! Fonte de candidatos: a planilha de trabalho
//!
//! Este módulo define:
//! - `CandidateRecord`, a linha da planilha já convertida para o formato interno
//! - A normalização dos candidatos (nomes, prestações, nota) e a impressão
//!   digital do conteúdo usada para detectar mudanças na própria planilha
//! - A capacidade `SheetSource` e duas implementações: o arquivo JSON
//!   normalizado que o pipeline de importação deposita, e uma fonte em memória
//!   para testes e demonstrações

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

use common_db::models::Period;

use crate::error::SheetError;
use crate::matcher::NaturalKey;

/// Texto de nota que a própria planilha insere nas linhas importadas.
/// Excluído da comparação de conteúdo.
pub const SHEET_IMPORT_MARKER: &str = "Importato da Google Sheets";

/// Uma linha da planilha, efêmera: existe apenas durante um ciclo de
/// análise/aplicação e nunca carrega o id do armazenamento
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub ambulatorio: String,
    pub data: NaiveDate,
    #[serde(with = "ora_format")]
    pub ora: NaiveTime,
    pub cognome: String,
    pub nome: String,
    pub tipo: String,
    #[serde(default)]
    pub prestazioni: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
    /// Referência à linha de origem (ex.: número da linha na planilha)
    #[serde(default)]
    pub raw_source_ref: Option<String>,
}

/// Candidato normalizado, com a chave natural e a impressão digital já
/// calculadas
#[derive(Debug, Clone)]
pub struct NormalizedCandidate {
    pub record: CandidateRecord,
    pub key: NaturalKey,
    pub fingerprint: String,
}

/// Normaliza um candidato: apara nomes, remove prestações vazias ou
/// duplicadas e suprime a nota-marcador da planilha
pub fn normalize(mut record: CandidateRecord) -> NormalizedCandidate {
    record.cognome = record.cognome.trim().to_string();
    record.nome = record.nome.trim().to_string();
    record.tipo = record.tipo.trim().to_string();
    record.note = normalize_note(record.note.take());

    let mut seen = BTreeSet::new();
    record.prestazioni = record
        .prestazioni
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.clone()))
        .collect();

    let key = NaturalKey::of_candidate(&record);
    let fingerprint = fingerprint(&key, &record.tipo, &record.prestazioni, record.note.as_deref());

    NormalizedCandidate {
        record,
        key,
        fingerprint,
    }
}

/// Nota vazia ou igual ao marcador de importação conta como ausente
pub fn normalize_note(note: Option<String>) -> Option<String> {
    match note {
        Some(n) => {
            let trimmed = n.trim();
            if trimmed.is_empty() || trimmed == SHEET_IMPORT_MARKER {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        None => None,
    }
}

/// Impressão digital do conteúdo de uma linha: chave natural + campos
/// comparáveis, com as prestações em ordem canônica
pub fn fingerprint(
    key: &NaturalKey,
    tipo: &str,
    prestazioni: &[String],
    note: Option<&str>,
) -> String {
    let mut ordinate: Vec<&str> = prestazioni.iter().map(|p| p.as_str()).collect();
    ordinate.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(key.canonical().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(tipo.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(ordinate.join(",").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(note.unwrap_or("").as_bytes());

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Capacidade de leitura da planilha
///
/// A planilha é lida uma única vez, por inteiro, no início de cada análise ou
/// aplicação; nenhuma outra fase faz I/O para a fonte externa.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn fetch(
        &self,
        ambulatorio: &str,
        period: &Period,
    ) -> Result<Vec<CandidateRecord>, SheetError>;
}

/// Fonte baseada no arquivo JSON normalizado depositado pelo pipeline de
/// importação
#[derive(Debug, Clone)]
pub struct JsonSheetSource {
    path: PathBuf,
}

impl JsonSheetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SheetSource for JsonSheetSource {
    async fn fetch(
        &self,
        ambulatorio: &str,
        period: &Period,
    ) -> Result<Vec<CandidateRecord>, SheetError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SheetError::Unavailable(format!(
                "Falha ao ler {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let rows: Vec<CandidateRecord> = serde_json::from_str(&raw)
            .map_err(|e| SheetError::Malformed(format!("JSON inválido: {}", e)))?;

        let filtered: Vec<CandidateRecord> = rows
            .into_iter()
            .filter(|r| r.ambulatorio == ambulatorio && period.contains(r.data))
            .collect();

        debug!(
            ambulatorio,
            periodo = %period,
            linhas = filtered.len(),
            "Planilha lida"
        );
        Ok(filtered)
    }
}

/// Fonte em memória, para testes e demonstrações
#[derive(Debug, Default)]
pub struct StaticSheet {
    rows: Mutex<Vec<CandidateRecord>>,
}

impl StaticSheet {
    pub fn new(rows: Vec<CandidateRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    /// Substitui o conteúdo da planilha, simulando uma edição externa
    pub fn set_rows(&self, rows: Vec<CandidateRecord>) {
        *self.rows.lock().expect("lock da planilha") = rows;
    }
}

#[async_trait]
impl SheetSource for StaticSheet {
    async fn fetch(
        &self,
        ambulatorio: &str,
        period: &Period,
    ) -> Result<Vec<CandidateRecord>, SheetError> {
        let rows = self.rows.lock().expect("lock da planilha");
        Ok(rows
            .iter()
            .filter(|r| r.ambulatorio == ambulatorio && period.contains(r.data))
            .cloned()
            .collect())
    }
}

/// Horas da planilha no formato "HH:MM" (com tolerância a "HH:MM:SS")
mod ora_format {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ora: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ora.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
