//! Testes de ponta a ponta do ciclo de sincronização
//!
//! Cobrem o fluxo completo analisar → resolver → aplicar contra um banco
//! SQLite real e uma planilha em memória.

use chrono::{NaiveDate, NaiveTime};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::tempdir;

use common_db::models::{ManualChanges, Period, Stato};
use common_db::{init_db_pool, DbConfig, Store};
use sheet_bridge::session::{ConflictChoice, SessionState, SyncCoordinator};
use sheet_bridge::sheet::{CandidateRecord, StaticSheet};

struct Harness {
    _dir: tempfile::TempDir,
    store: Store,
    sheet: Arc<StaticSheet>,
    coordinator: SyncCoordinator,
}

async fn harness(rows: Vec<CandidateRecord>) -> Harness {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("sync_flow.db");
    let config = DbConfig {
        db_path: db_path.to_str().unwrap().to_string(),
        max_connections: 2,
    };
    let pool = init_db_pool(&config).await.unwrap();
    let store = Store::new(pool);
    let sheet = Arc::new(StaticSheet::new(rows));
    let coordinator = SyncCoordinator::new(store.clone(), sheet.clone());
    Harness {
        _dir: dir,
        store,
        sheet,
        coordinator,
    }
}

fn candidato(prestazioni: &[&str]) -> CandidateRecord {
    CandidateRecord {
        ambulatorio: "pta_centro".to_string(),
        data: NaiveDate::from_ymd_opt(2026, 1, 11).unwrap(),
        ora: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        cognome: "TestImpianto".to_string(),
        nome: "Mario".to_string(),
        tipo: "PICC".to_string(),
        prestazioni: prestazioni.iter().map(|p| p.to_string()).collect(),
        note: None,
        raw_source_ref: Some("riga 2".to_string()),
    }
}

fn periodo() -> Period {
    Period::new(2026, 1)
}

const CHIAVE: &str = "pta_centro|2026-01-11|09:00|testimpianto|mario";

#[tokio::test]
async fn test_import_into_empty_store_creates_patient_and_appointment() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;

    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(analysis.success);
    assert!(!analysis.has_conflicts);
    assert!(analysis.conflicts.is_empty());
    // Sem conflitos, a sessão volta direto para o repouso
    assert_eq!(
        h.coordinator.session_state("pta_centro"),
        SessionState::Idle
    );

    // A análise não cria nada
    assert!(h
        .store
        .list_appointments("pta_centro", &periodo())
        .await
        .unwrap()
        .is_empty());

    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.created_patients, 1);
    assert_eq!(result.created_appointments, 1);
    assert_eq!(result.updated_appointments, 0);
    assert_eq!(result.skipped_conflicts, 0);
    assert!(result.per_record_failures.is_empty());

    let rows = h.store.list_appointments("pta_centro", &periodo()).await.unwrap();
    assert_eq!(rows.len(), 1);
    let appointment = &rows[0].appointment;
    assert_eq!(appointment.stato, Stato::DaFare);
    assert_eq!(appointment.prestazioni, vec!["medicazione_semplice".to_string()]);
    assert_eq!(appointment.last_import_key.as_deref(), Some(CHIAVE));
    assert!(!appointment.manually_modified);

    let patient = h
        .store
        .find_patient_by_name("pta_centro", "TestImpianto", "Mario")
        .await
        .unwrap()
        .expect("paciente criado");
    assert_eq!(patient.tipo, "PICC");
}

#[tokio::test]
async fn test_reimport_of_same_sheet_converges_instead_of_duplicating() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;

    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();
    let second = h
        .coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    assert_eq!(second.created_patients, 0);
    assert_eq!(second.created_appointments, 0);
    assert_eq!(second.updated_appointments, 0);

    let rows = h.store.list_appointments("pta_centro", &periodo()).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_analyze_is_idempotent() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    // Gera um conflito: edição manual + planilha alterada
    let id = h.store.list_appointments("pta_centro", &periodo()).await.unwrap()[0]
        .appointment
        .id;
    h.store
        .update_appointment_manual(
            id,
            &ManualChanges {
                prestazioni: Some(vec!["medicazione_occlusiva".to_string()]),
                ..Default::default()
            },
            "Domenico",
        )
        .await
        .unwrap();
    h.sheet.set_rows(vec![candidato(&["medicazione_trasparente"])]);

    let first = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    let second = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();

    assert!(first.has_conflicts);
    assert_eq!(first.conflicts.len(), second.conflicts.len());
    assert_eq!(first.conflicts[0].id, second.conflicts[0].id);
    assert_eq!(first.conflicts[0].id, CHIAVE);
    assert_eq!(
        first.conflicts[0].changed_fields,
        second.conflicts[0].changed_fields
    );
}

#[tokio::test]
async fn test_unchanged_sheet_row_never_conflicts_with_local_edits() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    // Edição manual: prestação extra e consulta efetuada
    let id = h.store.list_appointments("pta_centro", &periodo()).await.unwrap()[0]
        .appointment
        .id;
    let updated = h
        .store
        .update_appointment_manual(
            id,
            &ManualChanges {
                prestazioni: Some(vec![
                    "medicazione_semplice".to_string(),
                    "irrigazione_catetere".to_string(),
                ]),
                stato: Some(Stato::Effettuato),
                ..Default::default()
            },
            "Domenico",
        )
        .await
        .unwrap();
    assert!(updated.manually_modified);

    // A planilha não mudou: não tem nada de novo a dizer
    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(!analysis.has_conflicts);

    // A planilha muda: agora a divergência precisa de decisão humana
    h.sheet.set_rows(vec![candidato(&["medicazione_occlusiva"])]);
    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(analysis.has_conflicts);
    assert_eq!(
        h.coordinator.session_state("pta_centro"),
        SessionState::AwaitingResolution
    );
    assert_eq!(analysis.conflicts.len(), 1);
    assert_eq!(analysis.conflicts[0].id, CHIAVE);
    assert_eq!(
        analysis.conflicts[0].changed_fields,
        vec!["prestazioni".to_string()]
    );
    assert_eq!(
        analysis.conflicts[0].options.existing.prestazioni,
        vec![
            "medicazione_semplice".to_string(),
            "irrigazione_catetere".to_string()
        ]
    );
    assert_eq!(
        analysis.conflicts[0].options.candidate.prestazioni,
        vec!["medicazione_occlusiva".to_string()]
    );
}

#[tokio::test]
async fn test_unresolved_conflict_leaves_record_untouched() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    let id = h.store.list_appointments("pta_centro", &periodo()).await.unwrap()[0]
        .appointment
        .id;
    h.store
        .update_appointment_manual(
            id,
            &ManualChanges {
                prestazioni: Some(vec!["irrigazione_catetere".to_string()]),
                ..Default::default()
            },
            "Domenico",
        )
        .await
        .unwrap();
    h.sheet.set_rows(vec![candidato(&["medicazione_occlusiva"])]);

    let before = h.store.get_appointment(id).await.unwrap().unwrap();

    // Aplicação sem resolução: nenhum dos lados é sobrescrito
    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();
    assert_eq!(result.skipped_conflicts, 1);
    assert_eq!(result.updated_appointments, 0);

    let after = h.store.get_appointment(id).await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(&before).unwrap(),
        serde_json::to_value(&after).unwrap()
    );
}

#[tokio::test]
async fn test_conflict_resolved_with_candidate_restores_pristine_state() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    let id = h.store.list_appointments("pta_centro", &periodo()).await.unwrap()[0]
        .appointment
        .id;
    h.store
        .update_appointment_manual(
            id,
            &ManualChanges {
                prestazioni: Some(vec!["irrigazione_catetere".to_string()]),
                ..Default::default()
            },
            "Domenico",
        )
        .await
        .unwrap();
    h.sheet.set_rows(vec![candidato(&["medicazione_occlusiva"])]);

    let mut resolutions = HashMap::new();
    resolutions.insert(CHIAVE.to_string(), ConflictChoice::UseCandidate);
    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &resolutions, "Domenico")
        .await
        .unwrap();
    assert_eq!(result.updated_appointments, 1);
    assert_eq!(result.skipped_conflicts, 0);

    let after = h.store.get_appointment(id).await.unwrap().unwrap();
    assert_eq!(after.prestazioni, vec!["medicazione_occlusiva".to_string()]);
    assert!(!after.manually_modified);
    assert!(after.manually_modified_at.is_none());
    assert!(h.store.get_manual_edit(id).await.unwrap().is_none());

    // Pristino de novo: a próxima análise não vê nada
    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(!analysis.has_conflicts);
}

#[tokio::test]
async fn test_conflict_resolved_keeping_local_does_not_reappear() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    let id = h.store.list_appointments("pta_centro", &periodo()).await.unwrap()[0]
        .appointment
        .id;
    h.store
        .update_appointment_manual(
            id,
            &ManualChanges {
                prestazioni: Some(vec!["irrigazione_catetere".to_string()]),
                ..Default::default()
            },
            "Domenico",
        )
        .await
        .unwrap();
    h.sheet.set_rows(vec![candidato(&["medicazione_occlusiva"])]);

    let mut resolutions = HashMap::new();
    resolutions.insert(CHIAVE.to_string(), ConflictChoice::KeepExisting);
    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &resolutions, "Domenico")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.updated_appointments, 0);

    // Conteúdo local preservado, proveniência atualizada
    let after = h.store.get_appointment(id).await.unwrap().unwrap();
    assert_eq!(after.prestazioni, vec!["irrigazione_catetere".to_string()]);
    assert!(after.manually_modified);
    let edit = h.store.get_manual_edit(id).await.unwrap().unwrap();
    assert_eq!(edit.sheet_identifier, CHIAVE);

    // A mudança da planilha foi reconhecida: o conflito não reaparece
    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(!analysis.has_conflicts);
}

#[tokio::test]
async fn test_safe_update_converges_to_sheet() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    // Sem edição manual, a planilha continua autoritativa
    h.sheet.set_rows(vec![candidato(&[
        "medicazione_semplice",
        "irrigazione_catetere",
    ])]);

    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(!analysis.has_conflicts);

    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();
    assert_eq!(result.updated_appointments, 1);
    assert_eq!(result.created_appointments, 0);

    let rows = h.store.list_appointments("pta_centro", &periodo()).await.unwrap();
    assert_eq!(
        rows[0].appointment.prestazioni,
        vec![
            "medicazione_semplice".to_string(),
            "irrigazione_catetere".to_string()
        ]
    );
    assert!(!rows[0].appointment.manually_modified);
}

#[tokio::test]
async fn test_stale_resolution_keys_are_ignored() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;

    let mut resolutions = HashMap::new();
    resolutions.insert(
        "pta_centro|2026-01-20|10:00|rossi|anna".to_string(),
        ConflictChoice::UseCandidate,
    );

    // Nenhum conflito vivo corresponde à chave: ignorada, não é erro
    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &resolutions, "Domenico")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.created_appointments, 1);
}

#[tokio::test]
async fn test_sync_timestamp_is_written_and_monotonic() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;

    // Nunca sincronizado: ausência, não registro zerado
    assert!(h
        .coordinator
        .sync_timestamp("pta_centro")
        .await
        .unwrap()
        .is_none());

    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();
    let first = h
        .coordinator
        .sync_timestamp("pta_centro")
        .await
        .unwrap()
        .expect("carimbo gravado");
    assert_eq!(first.last_sync_by, "Domenico");
    assert_eq!(first.appointments_synced, 1);
    assert_eq!(first.patients_synced, 1);

    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Anna")
        .await
        .unwrap();
    let second = h
        .coordinator
        .sync_timestamp("pta_centro")
        .await
        .unwrap()
        .unwrap();
    assert!(second.last_sync_at > first.last_sync_at);
    assert_eq!(second.last_sync_by, "Anna");
    assert_eq!(second.appointments_synced, 0);

    // Outro ambulatório permanece intocado
    assert!(h
        .coordinator
        .sync_timestamp("villa_ginestre")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_manual_edit_audit_trail_is_listed_most_recent_first() {
    let h = harness(vec![
        candidato(&["medicazione_semplice"]),
        CandidateRecord {
            cognome: "Rosso".to_string(),
            nome: "Test".to_string(),
            ora: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ..candidato(&["medicazione_semplice"])
        },
    ])
    .await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    let rows = h.store.list_appointments("pta_centro", &periodo()).await.unwrap();
    for row in &rows {
        h.store
            .update_appointment_manual(
                row.appointment.id,
                &ManualChanges {
                    stato: Some(Stato::Effettuato),
                    ..Default::default()
                },
                "Domenico",
            )
            .await
            .unwrap();
    }

    let edits = h.coordinator.manual_edits("pta_centro").await.unwrap();
    assert_eq!(edits.len(), 2);
    assert!(edits[0].modified_at >= edits[1].modified_at);
    assert!(h
        .coordinator
        .manual_edits("villa_ginestre")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_sheet_rows_first_occurrence_wins() {
    // Duas linhas com a mesma chave natural e conteúdos diferentes
    let h = harness(vec![
        candidato(&["medicazione_semplice"]),
        candidato(&["medicazione_occlusiva"]),
    ])
    .await;

    let analysis = h.coordinator.analyze("pta_centro", &periodo()).await.unwrap();
    assert!(!analysis.has_conflicts);

    let result = h
        .coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();
    assert_eq!(result.created_patients, 1);
    assert_eq!(result.created_appointments, 1);

    // A primeira ocorrência vence; a duplicata não vira nem conflito nem
    // atualização
    let rows = h.store.list_appointments("pta_centro", &periodo()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].appointment.prestazioni,
        vec!["medicazione_semplice".to_string()]
    );
}

#[tokio::test]
async fn test_rollback_restores_empty_store_after_first_sync() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;

    // Antes de qualquer aplicação não há retrato
    assert!(h.coordinator.sync_backup("pta_centro").await.unwrap().is_none());

    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    // O retrato é o estado anterior à aplicação: vazio
    let backup = h
        .coordinator
        .sync_backup("pta_centro")
        .await
        .unwrap()
        .expect("retrato gravado pela aplicação");
    assert_eq!(backup.patients_count, 0);
    assert_eq!(backup.appointments_count, 0);

    let result = h.coordinator.rollback("pta_centro").await.unwrap();
    assert!(result.success);
    assert_eq!(result.restored_patients, 0);
    assert_eq!(result.restored_appointments, 0);

    assert!(h
        .store
        .list_appointments("pta_centro", &periodo())
        .await
        .unwrap()
        .is_empty());
    assert!(h
        .store
        .find_patient_by_name("pta_centro", "TestImpianto", "Mario")
        .await
        .unwrap()
        .is_none());
    assert!(h
        .coordinator
        .sync_timestamp("pta_centro")
        .await
        .unwrap()
        .is_none());

    // Retrato consumido: um segundo rollback não tem o que desfazer
    assert!(h.coordinator.sync_backup("pta_centro").await.unwrap().is_none());
    assert!(h.coordinator.rollback("pta_centro").await.is_err());
}

#[tokio::test]
async fn test_rollback_undoes_only_the_last_apply() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;
    h.coordinator
        .apply("pta_centro", &periodo(), &HashMap::new(), "Domenico")
        .await
        .unwrap();

    let id = h.store.list_appointments("pta_centro", &periodo()).await.unwrap()[0]
        .appointment
        .id;
    h.store
        .update_appointment_manual(
            id,
            &ManualChanges {
                prestazioni: Some(vec!["irrigazione_catetere".to_string()]),
                ..Default::default()
            },
            "Domenico",
        )
        .await
        .unwrap();

    // Segunda aplicação sobrescreve a edição manual por decisão do usuário
    h.sheet.set_rows(vec![candidato(&["medicazione_occlusiva"])]);
    let mut resolutions = HashMap::new();
    resolutions.insert(CHIAVE.to_string(), ConflictChoice::UseCandidate);
    h.coordinator
        .apply("pta_centro", &periodo(), &resolutions, "Domenico")
        .await
        .unwrap();

    // O rollback desfaz só a segunda aplicação: a edição manual volta
    let result = h.coordinator.rollback("pta_centro").await.unwrap();
    assert_eq!(result.restored_patients, 1);
    assert_eq!(result.restored_appointments, 1);

    let restored = h.store.get_appointment(id).await.unwrap().unwrap();
    assert_eq!(
        restored.prestazioni,
        vec!["irrigazione_catetere".to_string()]
    );
    assert!(restored.manually_modified);
    let edit = h
        .store
        .get_manual_edit(id)
        .await
        .unwrap()
        .expect("proveniência restaurada");
    assert_eq!(edit.modified_by, "Domenico");
}

#[tokio::test]
async fn test_duplicate_natural_key_in_store_aborts_analyze() {
    let h = harness(vec![candidato(&["medicazione_semplice"])]).await;

    // Dois pacientes homônimos com agendamentos idênticos: dado duplicado
    for _ in 0..2 {
        let patient = h
            .store
            .create_patient(&common_db::models::NewPatient {
                nome: "Mario".to_string(),
                cognome: "TestImpianto".to_string(),
                tipo: "PICC".to_string(),
                ambulatorio: "pta_centro".to_string(),
            })
            .await
            .unwrap();
        h.store
            .create_appointment(&common_db::models::NewAppointment {
                patient_id: patient.id,
                ambulatorio: "pta_centro".to_string(),
                data: NaiveDate::from_ymd_opt(2026, 1, 11).unwrap(),
                ora: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                tipo: "PICC".to_string(),
                prestazioni: vec!["medicazione_semplice".to_string()],
                stato: Stato::DaFare,
                note: None,
                last_import_key: None,
                last_import_fingerprint: None,
            })
            .await
            .unwrap();
    }

    let err = h
        .coordinator
        .analyze("pta_centro", &periodo())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        sheet_bridge::error::SyncError::DataIntegrity(_)
    ));
}
