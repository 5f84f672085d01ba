//! Modelos de dados compartilhados entre aplicações
//!
//! Este módulo define as estruturas de dados principais usadas pelo ecossistema da clínica

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Estados possíveis de um agendamento
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stato {
    /// Agendamento ainda por realizar
    DaFare,
    /// Consulta realizada
    Effettuato,
    /// Paciente não compareceu
    NonPresentato,
}

impl std::fmt::Display for Stato {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stato::DaFare => write!(f, "da_fare"),
            Stato::Effettuato => write!(f, "effettuato"),
            Stato::NonPresentato => write!(f, "non_presentato"),
        }
    }
}

impl std::str::FromStr for Stato {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "da_fare" => Ok(Stato::DaFare),
            "effettuato" => Ok(Stato::Effettuato),
            "non_presentato" => Ok(Stato::NonPresentato),
            other => Err(format!("Valor de stato inválido: {}", other)),
        }
    }
}

/// Tipo de entidade referenciada por um registro de edição manual
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Appointment,
    Patient,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Appointment => write!(f, "appointment"),
            EntityType::Patient => write!(f, "patient"),
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appointment" => Ok(EntityType::Appointment),
            "patient" => Ok(EntityType::Patient),
            other => Err(format!("Tipo de entidade inválido: {}", other)),
        }
    }
}

/// Período de consulta (ano + mês) usado pelas listagens e pela sincronização
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// Ano civil (ex.: 2026)
    pub anno: i32,
    /// Mês de 1 a 12
    pub mese: u32,
}

impl Period {
    pub fn new(anno: i32, mese: u32) -> Self {
        Self { anno, mese }
    }

    /// Primeiro dia do mês
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.anno, self.mese, 1)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(self.anno, 1, 1).expect("data válida"))
    }

    /// Primeiro dia do mês seguinte (limite exclusivo do período)
    pub fn first_day_next(&self) -> NaiveDate {
        let (anno, mese) = if self.mese >= 12 {
            (self.anno + 1, 1)
        } else {
            (self.anno, self.mese + 1)
        };
        NaiveDate::from_ymd_opt(anno, mese, 1).expect("data válida")
    }

    /// Verifica se uma data cai dentro do período
    pub fn contains(&self, data: NaiveDate) -> bool {
        data >= self.first_day() && data < self.first_day_next()
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.anno, self.mese)
    }
}

/// Representa um paciente
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    /// Identificador único do paciente
    pub id: Uuid,
    /// Nome próprio
    pub nome: String,
    /// Sobrenome
    pub cognome: String,
    /// Tipo de paciente (PICC, MED ou composto PICC_MED)
    pub tipo: String,
    /// Ambulatório ao qual o paciente pertence
    pub ambulatorio: String,
    /// Data e hora de criação do registro
    pub created_at: DateTime<Utc>,
    /// Data e hora da última atualização
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Patient {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: parse_uuid(row, "id")?,
            nome: row.try_get("nome")?,
            cognome: row.try_get("cognome")?,
            tipo: row.try_get("tipo")?,
            ambulatorio: row.try_get("ambulatorio")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Dados necessários para criar um paciente
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPatient {
    pub nome: String,
    pub cognome: String,
    pub tipo: String,
    pub ambulatorio: String,
}

/// Representa uma consulta/agendamento
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    /// Identificador único da consulta
    pub id: Uuid,
    /// Identificador do paciente
    pub patient_id: Uuid,
    /// Ambulatório
    pub ambulatorio: String,
    /// Data da consulta
    pub data: NaiveDate,
    /// Hora da consulta
    pub ora: NaiveTime,
    /// Tipo de consulta (PICC, MED, ...)
    pub tipo: String,
    /// Prestações solicitadas
    pub prestazioni: Vec<String>,
    /// Estado atual da consulta
    pub stato: Stato,
    /// Nota em texto livre
    pub note: Option<String>,
    /// Indica se um humano alterou o registro depois da última importação
    pub manually_modified: bool,
    /// Momento da alteração manual
    pub manually_modified_at: Option<DateTime<Utc>>,
    /// Autor da alteração manual
    pub manually_modified_by: Option<String>,
    /// Chave natural da linha da planilha da qual o registro foi importado
    pub last_import_key: Option<String>,
    /// Impressão digital do conteúdo da linha na última importação
    pub last_import_fingerprint: Option<String>,
    /// Data e hora de criação do registro
    pub created_at: DateTime<Utc>,
    /// Data e hora da última atualização
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Appointment {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let stato_raw: String = row.try_get("stato")?;
        let stato = stato_raw.parse::<Stato>().map_err(|e| sqlx::Error::ColumnDecode {
            index: String::from("stato"),
            source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        })?;

        let prestazioni_raw: String = row.try_get("prestazioni")?;
        let prestazioni: Vec<String> =
            serde_json::from_str(&prestazioni_raw).map_err(|e| sqlx::Error::ColumnDecode {
                index: String::from("prestazioni"),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: parse_uuid(row, "id")?,
            patient_id: parse_uuid(row, "patient_id")?,
            ambulatorio: row.try_get("ambulatorio")?,
            data: row.try_get("data")?,
            ora: row.try_get("ora")?,
            tipo: row.try_get("tipo")?,
            prestazioni,
            stato,
            note: row.try_get("note")?,
            manually_modified: row.try_get("manually_modified")?,
            manually_modified_at: row.try_get("manually_modified_at")?,
            manually_modified_by: row.try_get("manually_modified_by")?,
            last_import_key: row.try_get("last_import_key")?,
            last_import_fingerprint: row.try_get("last_import_fingerprint")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Dados necessários para criar um agendamento importado da planilha
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub ambulatorio: String,
    pub data: NaiveDate,
    pub ora: NaiveTime,
    pub tipo: String,
    pub prestazioni: Vec<String>,
    pub stato: Stato,
    pub note: Option<String>,
    /// Proveniência da importação (chave natural da linha)
    pub last_import_key: Option<String>,
    /// Proveniência da importação (impressão digital do conteúdo)
    pub last_import_fingerprint: Option<String>,
}

/// Campos de um agendamento que uma importação pode sobrescrever
#[derive(Debug, Clone)]
pub struct ImportPayload {
    pub tipo: String,
    pub prestazioni: Vec<String>,
    pub note: Option<String>,
    pub last_import_key: String,
    pub last_import_fingerprint: String,
}

/// Campos de um agendamento que uma edição manual pode alterar
///
/// `note` usa `Option<Option<_>>`: `None` deixa o campo como está,
/// `Some(None)` limpa a nota.
#[derive(Debug, Clone, Default)]
pub struct ManualChanges {
    pub prestazioni: Option<Vec<String>>,
    pub stato: Option<Stato>,
    pub note: Option<Option<String>>,
    pub tipo: Option<String>,
}

/// Agendamento acompanhado do nome do paciente, para o casamento por chave natural
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentWithPatient {
    #[serde(flatten)]
    pub appointment: Appointment,
    /// Sobrenome do paciente
    pub cognome: String,
    /// Nome próprio do paciente
    pub nome: String,
}

impl FromRow<'_, SqliteRow> for AppointmentWithPatient {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            appointment: Appointment::from_row(row)?,
            cognome: row.try_get("cognome")?,
            nome: row.try_get("nome")?,
        })
    }
}

/// Registro de proveniência de uma edição manual
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualEdit {
    /// Identificador único do registro
    pub id: Uuid,
    /// Tipo da entidade alterada
    pub entity_type: EntityType,
    /// Identificador da entidade alterada
    pub entity_id: Uuid,
    /// Ambulatório da entidade
    pub ambulatorio: String,
    /// Autor da alteração
    pub modified_by: String,
    /// Momento da alteração
    pub modified_at: DateTime<Utc>,
    /// Chave natural da linha da planilha da qual a entidade diverge
    pub sheet_identifier: String,
}

impl FromRow<'_, SqliteRow> for ManualEdit {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let entity_type_raw: String = row.try_get("entity_type")?;
        let entity_type =
            entity_type_raw
                .parse::<EntityType>()
                .map_err(|e| sqlx::Error::ColumnDecode {
                    index: String::from("entity_type"),
                    source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                })?;

        Ok(Self {
            id: parse_uuid(row, "id")?,
            entity_type,
            entity_id: parse_uuid(row, "entity_id")?,
            ambulatorio: row.try_get("ambulatorio")?,
            modified_by: row.try_get("modified_by")?,
            modified_at: row.try_get("modified_at")?,
            sheet_identifier: row.try_get("sheet_identifier")?,
        })
    }
}

/// Carimbo da última sincronização de um ambulatório
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTimestamp {
    /// Ambulatório sincronizado
    pub ambulatorio: String,
    /// Momento da última sincronização bem-sucedida
    pub last_sync_at: DateTime<Utc>,
    /// Quem executou a sincronização
    pub last_sync_by: String,
    /// Número de agendamentos criados ou atualizados
    pub appointments_synced: i64,
    /// Número de pacientes criados
    pub patients_synced: i64,
}

impl FromRow<'_, SqliteRow> for SyncTimestamp {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            ambulatorio: row.try_get("ambulatorio")?,
            last_sync_at: row.try_get("last_sync_at")?,
            last_sync_by: row.try_get("last_sync_by")?,
            appointments_synced: row.try_get("appointments_synced")?,
            patients_synced: row.try_get("patients_synced")?,
        })
    }
}

/// Metadados do retrato pré-sincronização de um ambulatório
///
/// O conteúdo do retrato (pacientes, agendamentos, edições manuais) fica
/// apenas no armazenamento; para fora só saem os metadados.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBackupInfo {
    /// Ambulatório retratado
    pub ambulatorio: String,
    /// Momento em que o retrato foi tirado
    pub created_at: DateTime<Utc>,
    /// Pacientes no retrato
    pub patients_count: i64,
    /// Agendamentos no retrato
    pub appointments_count: i64,
}

impl FromRow<'_, SqliteRow> for SyncBackupInfo {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            ambulatorio: row.try_get("ambulatorio")?,
            created_at: row.try_get("created_at")?,
            patients_count: row.try_get("patients_count")?,
            appointments_count: row.try_get("appointments_count")?,
        })
    }
}

// Os UUIDs são gravados como TEXT; decodificação explícita para evitar
// ambiguidade entre TEXT e BLOB no SQLite
fn parse_uuid(row: &SqliteRow, column: &str) -> sqlx::Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}
