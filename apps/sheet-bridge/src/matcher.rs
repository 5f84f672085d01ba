//! Casamento por chave natural
//!
//! A planilha não carrega identificadores do banco de dados, então o único
//! vínculo estável entre uma linha e um agendamento existente é a tupla
//! (ambulatório, data, hora, sobrenome, nome). O casamento é exato em todos
//! os campos; os nomes são comparados sem distinção de maiúsculas e com
//! espaços aparados. Nenhum casamento aproximado: ambiguidade vira "sem
//! casamento" (tratada como criação), nunca um palpite.

use chrono::{NaiveDate, NaiveTime};
use std::collections::HashMap;

use common_db::models::AppointmentWithPatient;

use crate::error::SyncError;
use crate::sheet::CandidateRecord;

/// Chave natural de um agendamento, nos dois lados da sincronização
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub ambulatorio: String,
    pub data: NaiveDate,
    pub ora: NaiveTime,
    /// Sobrenome em minúsculas, aparado
    pub cognome: String,
    /// Nome próprio em minúsculas, aparado
    pub nome: String,
}

impl NaturalKey {
    pub fn of_candidate(record: &CandidateRecord) -> Self {
        Self {
            ambulatorio: record.ambulatorio.clone(),
            data: record.data,
            ora: record.ora,
            cognome: norm_name(&record.cognome),
            nome: norm_name(&record.nome),
        }
    }

    pub fn of_appointment(row: &AppointmentWithPatient) -> Self {
        Self {
            ambulatorio: row.appointment.ambulatorio.clone(),
            data: row.appointment.data,
            ora: row.appointment.ora,
            cognome: norm_name(&row.cognome),
            nome: norm_name(&row.nome),
        }
    }

    /// Forma canônica da chave, usada como identificador de conflito e como
    /// `sheet_identifier` nos registros de proveniência
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.ambulatorio,
            self.data,
            self.ora.format("%H:%M"),
            self.cognome,
            self.nome
        )
    }
}

fn norm_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Índice dos agendamentos existentes por chave natural
#[derive(Debug)]
pub struct MatchIndex {
    by_key: HashMap<NaturalKey, usize>,
}

impl MatchIndex {
    /// Constrói o índice sobre os agendamentos do período
    ///
    /// Duas entradas com a mesma chave natural significam dados duplicados no
    /// armazenamento: falha imediata, escolher uma arbitrariamente esconderia
    /// o problema.
    pub fn build(rows: &[AppointmentWithPatient]) -> Result<Self, SyncError> {
        let mut by_key = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let key = NaturalKey::of_appointment(row);
            if let Some(previous) = by_key.insert(key.clone(), i) {
                return Err(SyncError::DataIntegrity(format!(
                    "Chave natural duplicada no armazenamento: {} (agendamentos {} e {})",
                    key.canonical(),
                    rows[previous].appointment.id,
                    row.appointment.id
                )));
            }
        }
        Ok(Self { by_key })
    }

    /// Casa um candidato com zero ou um agendamento existente
    pub fn lookup<'a>(
        &self,
        key: &NaturalKey,
        rows: &'a [AppointmentWithPatient],
    ) -> Option<&'a AppointmentWithPatient> {
        self.by_key.get(key).map(|&i| &rows[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common_db::models::{Appointment, Stato};
    use uuid::Uuid;

    fn existing(cognome: &str, nome: &str, ora: &str) -> AppointmentWithPatient {
        let now = Utc::now();
        AppointmentWithPatient {
            appointment: Appointment {
                id: Uuid::new_v4(),
                patient_id: Uuid::new_v4(),
                ambulatorio: "pta_centro".to_string(),
                data: NaiveDate::from_ymd_opt(2026, 1, 11).unwrap(),
                ora: NaiveTime::parse_from_str(ora, "%H:%M").unwrap(),
                tipo: "PICC".to_string(),
                prestazioni: vec!["medicazione_semplice".to_string()],
                stato: Stato::DaFare,
                note: None,
                manually_modified: false,
                manually_modified_at: None,
                manually_modified_by: None,
                last_import_key: None,
                last_import_fingerprint: None,
                created_at: now,
                updated_at: now,
            },
            cognome: cognome.to_string(),
            nome: nome.to_string(),
        }
    }

    fn candidate(cognome: &str, nome: &str, ora: &str) -> CandidateRecord {
        CandidateRecord {
            ambulatorio: "pta_centro".to_string(),
            data: NaiveDate::from_ymd_opt(2026, 1, 11).unwrap(),
            ora: NaiveTime::parse_from_str(ora, "%H:%M").unwrap(),
            cognome: cognome.to_string(),
            nome: nome.to_string(),
            tipo: "PICC".to_string(),
            prestazioni: vec![],
            note: None,
            raw_source_ref: None,
        }
    }

    #[test]
    fn test_match_is_case_insensitive_on_names() {
        let rows = vec![existing("TestImpianto", "Mario", "09:00")];
        let index = MatchIndex::build(&rows).unwrap();

        let key = NaturalKey::of_candidate(&candidate("  TESTIMPIANTO ", "mario", "09:00"));
        let matched = index.lookup(&key, &rows).expect("casamento esperado");
        assert_eq!(matched.appointment.id, rows[0].appointment.id);
    }

    #[test]
    fn test_no_match_on_different_time_or_name() {
        let rows = vec![existing("TestImpianto", "Mario", "09:00")];
        let index = MatchIndex::build(&rows).unwrap();

        let altra_ora = NaturalKey::of_candidate(&candidate("TestImpianto", "Mario", "09:30"));
        assert!(index.lookup(&altra_ora, &rows).is_none());

        // Nenhum casamento aproximado: um caractere diferente já separa
        let quasi = NaturalKey::of_candidate(&candidate("TestImpiante", "Mario", "09:00"));
        assert!(index.lookup(&quasi, &rows).is_none());
    }

    #[test]
    fn test_duplicate_natural_key_fails_fast() {
        let rows = vec![
            existing("Rosso", "Test", "10:00"),
            existing(" rosso ", "TEST", "10:00"),
        ];
        let err = MatchIndex::build(&rows).unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity(_)));
    }

    #[test]
    fn test_canonical_key_is_stable() {
        let key = NaturalKey::of_candidate(&candidate(" TestImpianto", "Mario ", "09:00"));
        assert_eq!(
            key.canonical(),
            "pta_centro|2026-01-11|09:00|testimpianto|mario"
        );
    }
}
