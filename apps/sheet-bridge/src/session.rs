//! Coordenação das sessões de sincronização
//!
//! Uma sessão cobre um ciclo completo de análise e aplicação para um
//! ambulatório. No máximo uma sessão não-ociosa por ambulatório: a tabela de
//! sessões funciona como um lock por inquilino, adquirido na entrada de cada
//! fase e liberado na saída. Uma segunda chamada para o mesmo ambulatório
//! falha imediatamente com `SessionBusy` em vez de esperar; ambulatórios
//! diferentes seguem em paralelo sem nenhum lock compartilhado.
//!
//! O lock nunca é mantido durante a leitura da planilha: a fonte externa é
//! lida por inteiro antes da aquisição, e a fase de mutação trabalha só com
//! candidatos já em memória.
//!
//! Uma análise sem conflitos volta direto para `Idle` em vez de parar em
//! `AwaitingResolution`: não há nada a resolver, e a aplicação refaz a
//! análise de qualquer forma.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use common_db::models::{
    AppointmentWithPatient, ManualEdit, Period, SyncBackupInfo, SyncTimestamp,
};
use common_db::Store;

use crate::apply;
use crate::detector::{classify, Classification};
use crate::error::{RecordFailure, SyncError};
use crate::matcher::MatchIndex;
use crate::sheet::{normalize, CandidateRecord, NormalizedCandidate, SheetSource};

/// Estado da sessão de um ambulatório
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Analyzing,
    AwaitingResolution,
    Applying,
    Failed,
}

impl SessionState {
    /// Estados que excluem o início de outra fase para o mesmo ambulatório
    fn is_busy(self) -> bool {
        matches!(self, SessionState::Analyzing | SessionState::Applying)
    }
}

/// Tabela de sessões por ambulatório
#[derive(Debug, Default)]
struct SessionTable {
    inner: Mutex<HashMap<String, SessionState>>,
}

impl SessionTable {
    fn try_begin(&self, ambulatorio: &str, state: SessionState) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().expect("lock da tabela de sessões");
        let current = inner
            .get(ambulatorio)
            .copied()
            .unwrap_or(SessionState::Idle);
        if current.is_busy() {
            return Err(SyncError::SessionBusy(ambulatorio.to_string()));
        }
        inner.insert(ambulatorio.to_string(), state);
        Ok(())
    }

    fn finish(&self, ambulatorio: &str, state: SessionState) {
        let mut inner = self.inner.lock().expect("lock da tabela de sessões");
        inner.insert(ambulatorio.to_string(), state);
    }

    fn state_of(&self, ambulatorio: &str) -> SessionState {
        self.inner
            .lock()
            .expect("lock da tabela de sessões")
            .get(ambulatorio)
            .copied()
            .unwrap_or(SessionState::Idle)
    }
}

/// Libera a sessão ao sair de escopo, inclusive em caso de erro
struct SessionGuard<'a> {
    table: &'a SessionTable,
    ambulatorio: String,
    release_to: SessionState,
}

impl<'a> SessionGuard<'a> {
    fn acquire(
        table: &'a SessionTable,
        ambulatorio: &str,
        state: SessionState,
        release_to: SessionState,
    ) -> Result<Self, SyncError> {
        table.try_begin(ambulatorio, state)?;
        Ok(Self {
            table,
            ambulatorio: ambulatorio.to_string(),
            release_to,
        })
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.table.finish(&self.ambulatorio, self.release_to);
    }
}

/// Uma das duas versões apresentadas ao usuário em um conflito
#[derive(Debug, Clone, Serialize)]
pub struct VersionView {
    pub cognome: String,
    pub nome: String,
    pub data: chrono::NaiveDate,
    pub ora: String,
    pub tipo: String,
    pub prestazioni: Vec<String>,
    pub note: Option<String>,
}

impl VersionView {
    fn of_existing(row: &AppointmentWithPatient) -> Self {
        Self {
            cognome: row.cognome.clone(),
            nome: row.nome.clone(),
            data: row.appointment.data,
            ora: row.appointment.ora.format("%H:%M").to_string(),
            tipo: row.appointment.tipo.clone(),
            prestazioni: row.appointment.prestazioni.clone(),
            note: row.appointment.note.clone(),
        }
    }

    fn of_candidate(candidate: &NormalizedCandidate) -> Self {
        Self {
            cognome: candidate.record.cognome.clone(),
            nome: candidate.record.nome.clone(),
            data: candidate.record.data,
            ora: candidate.record.ora.format("%H:%M").to_string(),
            tipo: candidate.record.tipo.clone(),
            prestazioni: candidate.record.prestazioni.clone(),
            note: candidate.record.note.clone(),
        }
    }
}

/// Um conflito a resolver, com identificador estável derivado da chave natural
#[derive(Debug, Clone, Serialize)]
pub struct ConflictView {
    pub id: String,
    pub changed_fields: Vec<String>,
    pub options: ConflictOptions,
}

/// As duas versões entre as quais o usuário escolhe
#[derive(Debug, Clone, Serialize)]
pub struct ConflictOptions {
    pub existing: VersionView,
    pub candidate: VersionView,
}

/// Resultado da fase de análise. Nenhum registro foi alterado.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflicts: Vec<ConflictView>,
}

/// Escolha do usuário para um conflito
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Mantém a versão local; a mudança da planilha é reconhecida e ignorada
    KeepExisting,
    /// Sobrescreve com a versão da planilha; o registro volta a ser
    /// pristino de importação
    UseCandidate,
}

/// Resultado de um rollback da última sincronização
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub success: bool,
    pub restored_patients: i64,
    pub restored_appointments: i64,
}

/// Resultado da fase de aplicação
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub success: bool,
    pub created_patients: i64,
    pub created_appointments: i64,
    pub updated_appointments: i64,
    pub skipped_conflicts: i64,
    pub per_record_failures: Vec<RecordFailure>,
}

/// Plano de uma rodada de sincronização: cada candidato com sua classificação
pub(crate) struct Plan {
    pub entries: Vec<PlanEntry>,
}

pub(crate) struct PlanEntry {
    pub candidate: NormalizedCandidate,
    pub classification: Classification,
    pub existing: Option<AppointmentWithPatient>,
}

/// Orquestra os ciclos de análise e aplicação por ambulatório
pub struct SyncCoordinator {
    store: Store,
    sheet: Arc<dyn SheetSource>,
    sessions: SessionTable,
}

impl SyncCoordinator {
    pub fn new(store: Store, sheet: Arc<dyn SheetSource>) -> Self {
        Self {
            store,
            sheet,
            sessions: SessionTable::default(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Estado atual da sessão de um ambulatório
    pub fn session_state(&self, ambulatorio: &str) -> SessionState {
        self.sessions.state_of(ambulatorio)
    }

    /// Fase de análise: classifica todos os candidatos do período sem alterar
    /// nenhum registro. Conflitos não resolvidos voltam ao chamador.
    pub async fn analyze(
        &self,
        ambulatorio: &str,
        period: &Period,
    ) -> Result<AnalyzeResult, SyncError> {
        // Leitura da fonte externa antes de adquirir a sessão
        let rows = self.sheet.fetch(ambulatorio, period).await?;

        let mut guard = SessionGuard::acquire(
            &self.sessions,
            ambulatorio,
            SessionState::Analyzing,
            SessionState::Idle,
        )?;

        let plan = self.build_plan(ambulatorio, period, rows).await?;

        let conflicts: Vec<ConflictView> = plan
            .entries
            .iter()
            .filter_map(|entry| match &entry.classification {
                Classification::Conflict { changed } => {
                    let existing = entry
                        .existing
                        .as_ref()
                        .expect("conflito implica registro casado");
                    Some(ConflictView {
                        id: entry.candidate.key.canonical(),
                        changed_fields: changed.iter().map(|c| c.to_string()).collect(),
                        options: ConflictOptions {
                            existing: VersionView::of_existing(existing),
                            candidate: VersionView::of_candidate(&entry.candidate),
                        },
                    })
                }
                _ => None,
            })
            .collect();

        let has_conflicts = !conflicts.is_empty();
        if has_conflicts {
            guard.release_to = SessionState::AwaitingResolution;
        }

        info!(
            ambulatorio,
            periodo = %period,
            candidatos = plan.entries.len(),
            conflitos = conflicts.len(),
            "Análise concluída"
        );

        Ok(AnalyzeResult {
            success: true,
            has_conflicts,
            conflicts,
        })
    }

    /// Fase de aplicação: refaz a análise (os dados podem ter mudado desde a
    /// última chamada), aplica criações e atualizações seguras, aplica os
    /// conflitos resolvidos e grava o carimbo de sincronização.
    ///
    /// Conflitos ausentes de `resolutions` ficam intocados; chaves de
    /// resolução que já não correspondem a um conflito vivo são ignoradas.
    pub async fn apply(
        &self,
        ambulatorio: &str,
        period: &Period,
        resolutions: &HashMap<String, ConflictChoice>,
        run_by: &str,
    ) -> Result<ApplyResult, SyncError> {
        // Leitura da fonte externa antes de adquirir a sessão
        let rows = self.sheet.fetch(ambulatorio, period).await?;

        let mut guard = SessionGuard::acquire(
            &self.sessions,
            ambulatorio,
            SessionState::Applying,
            SessionState::Failed,
        )?;

        // Retrato pré-aplicação, consumível pelo rollback
        self.store.snapshot_for_sync(ambulatorio).await?;

        let plan = self.build_plan(ambulatorio, period, rows).await?;
        let totals = apply::execute_plan(&self.store, plan, resolutions).await?;

        self.store
            .put_sync_timestamp(
                ambulatorio,
                run_by,
                totals.created_appointments + totals.updated_appointments,
                totals.created_patients,
            )
            .await?;

        guard.release_to = SessionState::Idle;

        info!(
            ambulatorio,
            periodo = %period,
            created_patients = totals.created_patients,
            created_appointments = totals.created_appointments,
            updated_appointments = totals.updated_appointments,
            skipped_conflicts = totals.skipped_conflicts,
            failures = totals.failures.len(),
            "Aplicação concluída"
        );

        Ok(ApplyResult {
            success: totals.failures.is_empty(),
            created_patients: totals.created_patients,
            created_appointments: totals.created_appointments,
            updated_appointments: totals.updated_appointments,
            skipped_conflicts: totals.skipped_conflicts,
            per_record_failures: totals.failures,
        })
    }

    /// Carimbo da última sincronização; `None` significa "nunca sincronizado"
    pub async fn sync_timestamp(
        &self,
        ambulatorio: &str,
    ) -> Result<Option<SyncTimestamp>, SyncError> {
        Ok(self.store.get_sync_timestamp(ambulatorio).await?)
    }

    /// Edições manuais do ambulatório, mais recentes primeiro
    pub async fn manual_edits(&self, ambulatorio: &str) -> Result<Vec<ManualEdit>, SyncError> {
        Ok(self.store.list_manual_edits(ambulatorio).await?)
    }

    /// Metadados do retrato disponível para rollback, se houver
    pub async fn sync_backup(
        &self,
        ambulatorio: &str,
    ) -> Result<Option<SyncBackupInfo>, SyncError> {
        Ok(self.store.get_sync_backup(ambulatorio).await?)
    }

    /// Desfaz a última aplicação, restaurando o retrato pré-aplicação
    ///
    /// Toma o mesmo lock de sessão da aplicação. A restauração é uma única
    /// transação, então a sessão volta a `Idle` mesmo em caso de falha.
    pub async fn rollback(&self, ambulatorio: &str) -> Result<RollbackResult, SyncError> {
        let _guard = SessionGuard::acquire(
            &self.sessions,
            ambulatorio,
            SessionState::Applying,
            SessionState::Idle,
        )?;

        let (restored_patients, restored_appointments) =
            self.store.restore_sync_backup(ambulatorio).await?;

        info!(
            ambulatorio,
            restored_patients, restored_appointments, "Última sincronização desfeita"
        );

        Ok(RollbackResult {
            success: true,
            restored_patients,
            restored_appointments,
        })
    }

    /// Monta o plano da rodada: casa e classifica cada candidato
    async fn build_plan(
        &self,
        ambulatorio: &str,
        period: &Period,
        rows: Vec<CandidateRecord>,
    ) -> Result<Plan, SyncError> {
        let existing = self.store.list_appointments(ambulatorio, period).await?;
        let index = MatchIndex::build(&existing)?;

        let mut seen_keys = HashSet::new();
        let mut entries = Vec::with_capacity(rows.len());

        for row in rows {
            let candidate = normalize(row);

            // Linhas duplicadas na própria planilha: a primeira vence
            if !seen_keys.insert(candidate.key.clone()) {
                warn!(
                    chiave = %candidate.key.canonical(),
                    "Linha duplicada na planilha ignorada"
                );
                continue;
            }

            let matched = index.lookup(&candidate.key, &existing).cloned();
            let classification = classify(&candidate, matched.as_ref());
            entries.push(PlanEntry {
                candidate,
                classification,
                existing: matched,
            });
        }

        Ok(Plan { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SheetError;
    use crate::sheet::MockSheetSource;
    use common_db::{init_db_pool, DbConfig};
    use tempfile::tempdir;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("session.db");
        let config = DbConfig {
            db_path: db_path.to_str().unwrap().to_string(),
            max_connections: 2,
        };
        let pool = init_db_pool(&config).await.unwrap();
        (temp_dir, Store::new(pool))
    }

    #[test]
    fn test_session_table_excludes_concurrent_phases() {
        let table = SessionTable::default();

        table
            .try_begin("pta_centro", SessionState::Analyzing)
            .unwrap();
        let err = table
            .try_begin("pta_centro", SessionState::Applying)
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionBusy(_)));

        // Outro ambulatório segue em paralelo
        table
            .try_begin("villa_ginestre", SessionState::Applying)
            .unwrap();

        // Liberada a sessão, o ambulatório volta a aceitar chamadas
        table.finish("pta_centro", SessionState::Idle);
        table
            .try_begin("pta_centro", SessionState::Applying)
            .unwrap();
    }

    #[test]
    fn test_awaiting_resolution_does_not_block() {
        let table = SessionTable::default();
        table.finish("pta_centro", SessionState::AwaitingResolution);
        // O usuário pode demorar a resolver; a próxima fase deve poder entrar
        table
            .try_begin("pta_centro", SessionState::Applying)
            .unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let table = SessionTable::default();
        {
            let _guard = SessionGuard::acquire(
                &table,
                "pta_centro",
                SessionState::Analyzing,
                SessionState::Idle,
            )
            .unwrap();
            assert_eq!(table.state_of("pta_centro"), SessionState::Analyzing);
        }
        assert_eq!(table.state_of("pta_centro"), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_sheet_fails_wholesale() {
        let (_dir, store) = test_store().await;

        let mut sheet = MockSheetSource::new();
        sheet.expect_fetch().returning(|_, _| {
            Err(SheetError::Unavailable("timeout".to_string()))
        });

        let coordinator = SyncCoordinator::new(store, Arc::new(sheet));
        let err = coordinator
            .analyze("pta_centro", &Period::new(2026, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SheetUnavailable(_)));

        // A falha aconteceu antes da aquisição: a sessão continua ociosa
        assert_eq!(
            coordinator.session_state("pta_centro"),
            SessionState::Idle
        );
    }
}
