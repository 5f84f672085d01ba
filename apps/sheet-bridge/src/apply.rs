//! Motor de aplicação
//!
//! Executa o plano montado pela análise contra o armazenamento autoritativo.
//! Cada registro é uma unidade atômica própria: se a unidade falha no meio, o
//! registro volta ao estado anterior e a falha é reportada no resultado,
//! enquanto os demais registros da mesma chamada continuam sendo aplicados.
//! Sucesso parcial é esperado e explícito, nunca engolido.

use std::collections::HashMap;
use tracing::{debug, warn};

use common_db::models::{ImportPayload, NewAppointment, NewPatient, Stato};
use common_db::store::PatientRef;
use common_db::{DbError, Store};

use crate::detector::Classification;
use crate::error::{RecordFailure, SyncError};
use crate::session::{ConflictChoice, Plan, PlanEntry};
use crate::sheet::NormalizedCandidate;

/// Contadores acumulados de uma rodada de aplicação
#[derive(Debug, Default)]
pub(crate) struct ApplyTotals {
    pub created_patients: i64,
    pub created_appointments: i64,
    pub updated_appointments: i64,
    pub skipped_conflicts: i64,
    pub failures: Vec<RecordFailure>,
}

/// Aplica o plano registro a registro
///
/// Só erros irrecuperáveis de armazenamento abortam a chamada inteira; todo o
/// resto degrada para falha por registro.
pub(crate) async fn execute_plan(
    store: &Store,
    plan: Plan,
    resolutions: &HashMap<String, ConflictChoice>,
) -> Result<ApplyTotals, SyncError> {
    let mut totals = ApplyTotals::default();

    for entry in plan.entries {
        let natural_key = entry.candidate.key.canonical();
        let outcome = apply_entry(store, &entry, resolutions, &mut totals).await;

        if let Err(e) = outcome {
            if e.is_unrecoverable() {
                return Err(SyncError::Storage(e));
            }
            warn!(chiave = %natural_key, erro = %e, "Falha ao aplicar registro");
            totals.failures.push(RecordFailure {
                natural_key,
                reason: e.to_string(),
            });
        }
    }

    Ok(totals)
}

async fn apply_entry(
    store: &Store,
    entry: &PlanEntry,
    resolutions: &HashMap<String, ConflictChoice>,
    totals: &mut ApplyTotals,
) -> Result<(), DbError> {
    match &entry.classification {
        Classification::NoOp => Ok(()),

        Classification::Create => {
            let record = &entry.candidate.record;
            let patient_ref = match store
                .find_patient_by_name(&record.ambulatorio, &record.cognome, &record.nome)
                .await?
            {
                Some(patient) => PatientRef::Existing(patient.id),
                None => PatientRef::New(NewPatient {
                    nome: record.nome.clone(),
                    cognome: record.cognome.clone(),
                    tipo: record.tipo.clone(),
                    ambulatorio: record.ambulatorio.clone(),
                }),
            };

            let new = NewAppointment {
                // Substituído dentro da transação conforme o PatientRef
                patient_id: uuid::Uuid::nil(),
                ambulatorio: record.ambulatorio.clone(),
                data: record.data,
                ora: record.ora,
                tipo: record.tipo.clone(),
                prestazioni: record.prestazioni.clone(),
                stato: Stato::DaFare,
                note: record.note.clone(),
                last_import_key: Some(entry.candidate.key.canonical()),
                last_import_fingerprint: Some(entry.candidate.fingerprint.clone()),
            };

            let (appointment, created_patient) =
                store.create_imported_appointment(patient_ref, new).await?;
            totals.created_appointments += 1;
            if created_patient.is_some() {
                totals.created_patients += 1;
            }
            debug!(appointment_id = %appointment.id, "Registro criado");
            Ok(())
        }

        Classification::SafeUpdate { .. } => {
            let existing = entry.existing.as_ref().expect("safe-update implica casamento");
            store
                .apply_import_payload(
                    existing.appointment.id,
                    &import_payload(&entry.candidate),
                    false,
                )
                .await?;
            totals.updated_appointments += 1;
            Ok(())
        }

        Classification::Conflict { .. } => {
            let existing = entry.existing.as_ref().expect("conflito implica casamento");
            let id = entry.candidate.key.canonical();

            match resolutions.get(&id) {
                // Sem resolução: nenhum dos lados é sobrescrito
                None => {
                    totals.skipped_conflicts += 1;
                    debug!(chiave = %id, "Conflito não resolvido, registro intocado");
                    Ok(())
                }
                Some(ConflictChoice::UseCandidate) => {
                    store
                        .apply_import_payload(
                            existing.appointment.id,
                            &import_payload(&entry.candidate),
                            true,
                        )
                        .await?;
                    totals.updated_appointments += 1;
                    Ok(())
                }
                Some(ConflictChoice::KeepExisting) => {
                    // Conteúdo local intocado; a proveniência passa a apontar
                    // para a nova linha, senão o mesmo conflito reapareceria
                    // a cada análise
                    store
                        .refresh_import_provenance(
                            existing.appointment.id,
                            &id,
                            &entry.candidate.fingerprint,
                        )
                        .await?;
                    Ok(())
                }
            }
        }
    }
}

fn import_payload(candidate: &NormalizedCandidate) -> ImportPayload {
    ImportPayload {
        tipo: candidate.record.tipo.clone(),
        prestazioni: candidate.record.prestazioni.clone(),
        note: candidate.record.note.clone(),
        last_import_key: candidate.key.canonical(),
        last_import_fingerprint: candidate.fingerprint.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::{normalize, CandidateRecord};
    use chrono::{NaiveDate, NaiveTime, Utc};
    use common_db::models::{Appointment, AppointmentWithPatient};
    use common_db::{init_db_pool, DbConfig};
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("apply.db");
        let config = DbConfig {
            db_path: db_path.to_str().unwrap().to_string(),
            max_connections: 2,
        };
        let pool = init_db_pool(&config).await.unwrap();
        (temp_dir, Store::new(pool))
    }

    fn candidate(cognome: &str, prestazioni: &[&str]) -> NormalizedCandidate {
        normalize(CandidateRecord {
            ambulatorio: "pta_centro".to_string(),
            data: NaiveDate::from_ymd_opt(2026, 1, 11).unwrap(),
            ora: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            cognome: cognome.to_string(),
            nome: "Mario".to_string(),
            tipo: "PICC".to_string(),
            prestazioni: prestazioni.iter().map(|p| p.to_string()).collect(),
            note: None,
            raw_source_ref: None,
        })
    }

    /// Registro casado que já não existe no banco: a unidade dele vai falhar
    fn ghost_match(candidate: &NormalizedCandidate) -> AppointmentWithPatient {
        let now = Utc::now();
        AppointmentWithPatient {
            appointment: Appointment {
                id: Uuid::new_v4(),
                patient_id: Uuid::new_v4(),
                ambulatorio: candidate.record.ambulatorio.clone(),
                data: candidate.record.data,
                ora: candidate.record.ora,
                tipo: candidate.record.tipo.clone(),
                prestazioni: vec!["medicazione_occlusiva".to_string()],
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
            cognome: candidate.record.cognome.clone(),
            nome: candidate.record.nome.clone(),
        }
    }

    #[tokio::test]
    async fn test_failed_record_degrades_to_partial_success() {
        let (_dir, store) = test_store().await;

        let gone = candidate("Rosso", &["medicazione_semplice"]);
        let ghost = ghost_match(&gone);
        let fresh = candidate("TestImpianto", &["medicazione_semplice"]);

        let plan = Plan {
            entries: vec![
                PlanEntry {
                    candidate: gone.clone(),
                    classification: Classification::SafeUpdate {
                        changed: vec!["prestazioni"],
                    },
                    existing: Some(ghost),
                },
                PlanEntry {
                    candidate: fresh,
                    classification: Classification::Create,
                    existing: None,
                },
            ],
        };

        let totals = execute_plan(&store, plan, &HashMap::new()).await.unwrap();

        // A unidade que falhou é reportada; as demais continuam e confirmam
        assert_eq!(totals.failures.len(), 1);
        assert_eq!(totals.failures[0].natural_key, gone.key.canonical());
        assert_eq!(totals.created_appointments, 1);
        assert_eq!(totals.created_patients, 1);
        assert_eq!(totals.updated_appointments, 0);

        let created = store
            .find_patient_by_name("pta_centro", "TestImpianto", "Mario")
            .await
            .unwrap();
        assert!(created.is_some());
    }
}
