//! Acesso ao armazenamento autoritativo
//!
//! Este módulo concentra todas as consultas e mutações sobre pacientes,
//! agendamentos, edições manuais e carimbos de sincronização. As operações
//! compostas (edição manual + proveniência, importação + limpeza do estado
//! manual) são executadas em uma única transação: uma falha no meio não pode
//! deixar `manually_modified = 1` sem o registro correspondente em
//! `manual_edits`, nem o contrário.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{
    Appointment, AppointmentWithPatient, EntityType, ImportPayload, ManualChanges, ManualEdit,
    NewAppointment, NewPatient, Patient, Period, SyncBackupInfo, SyncTimestamp,
};

/// Referência a um paciente durante a importação: já existente ou a criar
#[derive(Debug, Clone)]
pub enum PatientRef {
    Existing(Uuid),
    New(NewPatient),
}

/// Fachada de acesso ao banco de dados da agenda
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Pacientes
    // ------------------------------------------------------------------

    /// Cria um paciente e devolve o registro completo
    pub async fn create_patient(&self, new: &NewPatient) -> Result<Patient, DbError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO patients (id, created_at, updated_at, nome, cognome, tipo, ambulatorio)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .bind(now)
        .bind(new.nome.trim())
        .bind(new.cognome.trim())
        .bind(&new.tipo)
        .bind(&new.ambulatorio)
        .execute(&self.pool)
        .await?;

        Ok(Patient {
            id,
            nome: new.nome.trim().to_string(),
            cognome: new.cognome.trim().to_string(),
            tipo: new.tipo.clone(),
            ambulatorio: new.ambulatorio.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>, DbError> {
        let patient = sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(patient)
    }

    /// Procura um paciente pelo nome, insensível a maiúsculas e espaços
    ///
    /// Se existirem homônimos no mesmo ambulatório, devolve o mais antigo.
    pub async fn find_patient_by_name(
        &self,
        ambulatorio: &str,
        cognome: &str,
        nome: &str,
    ) -> Result<Option<Patient>, DbError> {
        let patient = sqlx::query_as::<_, Patient>(
            r#"
            SELECT * FROM patients
            WHERE ambulatorio = ?
              AND LOWER(TRIM(cognome)) = ?
              AND LOWER(TRIM(nome)) = ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(ambulatorio)
        .bind(cognome.trim().to_lowercase())
        .bind(nome.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(patient)
    }

    // ------------------------------------------------------------------
    // Agendamentos
    // ------------------------------------------------------------------

    pub async fn create_appointment(&self, new: &NewAppointment) -> Result<Appointment, DbError> {
        let mut tx = self.pool.begin().await?;
        let appointment = insert_appointment(&mut tx, new).await?;
        tx.commit().await?;
        Ok(appointment)
    }

    pub async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>, DbError> {
        let appointment =
            sqlx::query_as::<_, Appointment>("SELECT * FROM appointments WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(appointment)
    }

    /// Lista os agendamentos de um ambulatório no período, com o nome do
    /// paciente já resolvido para o casamento por chave natural
    pub async fn list_appointments(
        &self,
        ambulatorio: &str,
        period: &Period,
    ) -> Result<Vec<AppointmentWithPatient>, DbError> {
        let rows = sqlx::query_as::<_, AppointmentWithPatient>(
            r#"
            SELECT a.*, p.cognome, p.nome
            FROM appointments a
            JOIN patients p ON p.id = a.patient_id
            WHERE a.ambulatorio = ?
              AND a.data >= ?
              AND a.data < ?
            ORDER BY a.data, a.ora
            "#,
        )
        .bind(ambulatorio)
        .bind(period.first_day())
        .bind(period.first_day_next())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Cria um agendamento importado da planilha, criando também o paciente
    /// quando necessário. Tudo em uma única transação: a unidade atômica por
    /// registro exigida pela fase de aplicação.
    ///
    /// Devolve o agendamento e o id do paciente criado, se houver.
    pub async fn create_imported_appointment(
        &self,
        patient_ref: PatientRef,
        mut new: NewAppointment,
    ) -> Result<(Appointment, Option<Uuid>), DbError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let created_patient = match patient_ref {
            PatientRef::Existing(id) => {
                new.patient_id = id;
                None
            }
            PatientRef::New(p) => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO patients (id, created_at, updated_at, nome, cognome, tipo, ambulatorio)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id.to_string())
                .bind(now)
                .bind(now)
                .bind(p.nome.trim())
                .bind(p.cognome.trim())
                .bind(&p.tipo)
                .bind(&p.ambulatorio)
                .execute(&mut *tx)
                .await?;
                new.patient_id = id;
                Some(id)
            }
        };

        let appointment = insert_appointment(&mut tx, &new).await?;
        tx.commit().await?;

        debug!(
            appointment_id = %appointment.id,
            created_patient = ?created_patient,
            "Agendamento importado criado"
        );
        Ok((appointment, created_patient))
    }

    /// Sobrescreve o conteúdo de um agendamento com a versão da planilha
    ///
    /// Usado para atualizações seguras e para conflitos resolvidos a favor da
    /// planilha. Com `clear_manual` o estado de edição manual é zerado e o
    /// registro em `manual_edits` removido, na mesma transação: o registro
    /// volta a ser "pristino de importação".
    pub async fn apply_import_payload(
        &self,
        id: Uuid,
        payload: &ImportPayload,
        clear_manual: bool,
    ) -> Result<(), DbError> {
        let prestazioni = encode_prestazioni(&payload.prestazioni)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let query = if clear_manual {
            r#"
            UPDATE appointments
            SET tipo = ?, prestazioni = ?, note = ?,
                last_import_key = ?, last_import_fingerprint = ?, updated_at = ?,
                manually_modified = 0, manually_modified_at = NULL, manually_modified_by = NULL
            WHERE id = ?
            "#
        } else {
            r#"
            UPDATE appointments
            SET tipo = ?, prestazioni = ?, note = ?,
                last_import_key = ?, last_import_fingerprint = ?, updated_at = ?
            WHERE id = ?
            "#
        };

        let result = sqlx::query(query)
            .bind(&payload.tipo)
            .bind(prestazioni)
            .bind(&payload.note)
            .bind(&payload.last_import_key)
            .bind(&payload.last_import_fingerprint)
            .bind(now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("Agendamento {}", id)));
        }

        if clear_manual {
            sqlx::query("DELETE FROM manual_edits WHERE entity_id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Atualiza apenas a proveniência de importação de um agendamento,
    /// deixando o conteúdo intocado
    ///
    /// Usado quando um conflito é resolvido mantendo a versão local: a linha
    /// da planilha mudou, o humano escolheu ignorá-la, e o registro em
    /// `manual_edits` passa a referenciar a nova linha (substituição).
    pub async fn refresh_import_provenance(
        &self,
        id: Uuid,
        key: &str,
        fingerprint: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE appointments
            SET last_import_key = ?, last_import_fingerprint = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(key)
        .bind(fingerprint)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("Agendamento {}", id)));
        }

        sqlx::query("UPDATE manual_edits SET sheet_identifier = ? WHERE entity_id = ?")
            .bind(key)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Aplica uma edição humana a um agendamento
    ///
    /// A atualização do registro e a gravação da proveniência em
    /// `manual_edits` acontecem na mesma transação.
    pub async fn update_appointment_manual(
        &self,
        id: Uuid,
        changes: &ManualChanges,
        modified_by: &str,
    ) -> Result<Appointment, DbError> {
        let current = self
            .get_appointment(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Agendamento {}", id)))?;

        let now = Utc::now();
        let prestazioni = changes
            .prestazioni
            .clone()
            .unwrap_or_else(|| current.prestazioni.clone());
        let stato = changes.stato.unwrap_or(current.stato);
        let note = match &changes.note {
            Some(n) => n.clone(),
            None => current.note.clone(),
        };
        let tipo = changes.tipo.clone().unwrap_or_else(|| current.tipo.clone());

        // Agendamentos nunca importados não têm linha de origem; a
        // proveniência referencia então o próprio registro
        let sheet_identifier = current
            .last_import_key
            .clone()
            .unwrap_or_else(|| format!("local:{}", id));

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE appointments
            SET prestazioni = ?, stato = ?, note = ?, tipo = ?,
                manually_modified = 1, manually_modified_at = ?, manually_modified_by = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encode_prestazioni(&prestazioni)?)
        .bind(stato.to_string())
        .bind(&note)
        .bind(&tipo)
        .bind(now)
        .bind(modified_by)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        upsert_manual_edit(
            &mut tx,
            EntityType::Appointment,
            id,
            &current.ambulatorio,
            modified_by,
            now,
            &sheet_identifier,
        )
        .await?;

        tx.commit().await?;

        self.get_appointment(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Agendamento {}", id)))
    }

    // ------------------------------------------------------------------
    // Edições manuais
    // ------------------------------------------------------------------

    pub async fn get_manual_edit(&self, entity_id: Uuid) -> Result<Option<ManualEdit>, DbError> {
        let edit = sqlx::query_as::<_, ManualEdit>("SELECT * FROM manual_edits WHERE entity_id = ?")
            .bind(entity_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(edit)
    }

    pub async fn is_manually_modified(&self, entity_id: Uuid) -> Result<bool, DbError> {
        Ok(self.get_manual_edit(entity_id).await?.is_some())
    }

    /// Lista as edições manuais de um ambulatório, mais recentes primeiro
    pub async fn list_manual_edits(&self, ambulatorio: &str) -> Result<Vec<ManualEdit>, DbError> {
        let edits = sqlx::query_as::<_, ManualEdit>(
            "SELECT * FROM manual_edits WHERE ambulatorio = ? ORDER BY modified_at DESC",
        )
        .bind(ambulatorio)
        .fetch_all(&self.pool)
        .await?;
        Ok(edits)
    }

    // ------------------------------------------------------------------
    // Carimbos de sincronização
    // ------------------------------------------------------------------

    /// Devolve o carimbo da última sincronização, se o ambulatório já foi
    /// sincronizado alguma vez
    pub async fn get_sync_timestamp(
        &self,
        ambulatorio: &str,
    ) -> Result<Option<SyncTimestamp>, DbError> {
        let stamp = sqlx::query_as::<_, SyncTimestamp>(
            "SELECT * FROM sync_timestamps WHERE ambulatorio = ?",
        )
        .bind(ambulatorio)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stamp)
    }

    /// Grava o carimbo de sincronização de um ambulatório (substituição)
    ///
    /// `last_sync_at` é estritamente crescente: se o relógio não avançou
    /// desde a gravação anterior, o novo valor é empurrado 1 ms à frente.
    pub async fn put_sync_timestamp(
        &self,
        ambulatorio: &str,
        last_sync_by: &str,
        appointments_synced: i64,
        patients_synced: i64,
    ) -> Result<SyncTimestamp, DbError> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_sync_at FROM sync_timestamps WHERE ambulatorio = ?")
                .bind(ambulatorio)
                .fetch_optional(&mut *tx)
                .await?;

        let mut last_sync_at = Utc::now();
        if let Some(prev) = previous {
            if last_sync_at <= prev {
                last_sync_at = prev + Duration::milliseconds(1);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO sync_timestamps (ambulatorio, last_sync_at, last_sync_by, appointments_synced, patients_synced)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(ambulatorio) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_sync_by = excluded.last_sync_by,
                appointments_synced = excluded.appointments_synced,
                patients_synced = excluded.patients_synced
            "#,
        )
        .bind(ambulatorio)
        .bind(last_sync_at)
        .bind(last_sync_by)
        .bind(appointments_synced)
        .bind(patients_synced)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SyncTimestamp {
            ambulatorio: ambulatorio.to_string(),
            last_sync_at,
            last_sync_by: last_sync_by.to_string(),
            appointments_synced,
            patients_synced,
        })
    }

    // ------------------------------------------------------------------
    // Retratos de sincronização
    // ------------------------------------------------------------------

    /// Tira o retrato pré-aplicação de um ambulatório (substituição)
    ///
    /// Um único slot por ambulatório: o retrato anterior é sobrescrito, então
    /// o rollback desfaz sempre a última aplicação e nada além dela.
    pub async fn snapshot_for_sync(&self, ambulatorio: &str) -> Result<SyncBackupInfo, DbError> {
        let mut tx = self.pool.begin().await?;

        let patients =
            sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE ambulatorio = ?")
                .bind(ambulatorio)
                .fetch_all(&mut *tx)
                .await?;
        let appointments =
            sqlx::query_as::<_, Appointment>("SELECT * FROM appointments WHERE ambulatorio = ?")
                .bind(ambulatorio)
                .fetch_all(&mut *tx)
                .await?;
        let manual_edits =
            sqlx::query_as::<_, ManualEdit>("SELECT * FROM manual_edits WHERE ambulatorio = ?")
                .bind(ambulatorio)
                .fetch_all(&mut *tx)
                .await?;
        let timestamp = sqlx::query_as::<_, SyncTimestamp>(
            "SELECT * FROM sync_timestamps WHERE ambulatorio = ?",
        )
        .bind(ambulatorio)
        .fetch_optional(&mut *tx)
        .await?;

        let info = SyncBackupInfo {
            ambulatorio: ambulatorio.to_string(),
            created_at: Utc::now(),
            patients_count: patients.len() as i64,
            appointments_count: appointments.len() as i64,
        };

        let timestamp_json = match &timestamp {
            Some(ts) => Some(encode_json(ts)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO sync_backups (
                ambulatorio, created_at, patients, appointments, manual_edits,
                sync_timestamp, patients_count, appointments_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ambulatorio) DO UPDATE SET
                created_at = excluded.created_at,
                patients = excluded.patients,
                appointments = excluded.appointments,
                manual_edits = excluded.manual_edits,
                sync_timestamp = excluded.sync_timestamp,
                patients_count = excluded.patients_count,
                appointments_count = excluded.appointments_count
            "#,
        )
        .bind(ambulatorio)
        .bind(info.created_at)
        .bind(encode_json(&patients)?)
        .bind(encode_json(&appointments)?)
        .bind(encode_json(&manual_edits)?)
        .bind(timestamp_json)
        .bind(info.patients_count)
        .bind(info.appointments_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            ambulatorio,
            patients = info.patients_count,
            appointments = info.appointments_count,
            "Retrato pré-aplicação gravado"
        );
        Ok(info)
    }

    /// Metadados do retrato disponível, se houver
    pub async fn get_sync_backup(
        &self,
        ambulatorio: &str,
    ) -> Result<Option<SyncBackupInfo>, DbError> {
        let info = sqlx::query_as::<_, SyncBackupInfo>(
            r#"
            SELECT ambulatorio, created_at, patients_count, appointments_count
            FROM sync_backups WHERE ambulatorio = ?
            "#,
        )
        .bind(ambulatorio)
        .fetch_optional(&self.pool)
        .await?;
        Ok(info)
    }

    /// Restaura o retrato pré-aplicação de um ambulatório
    ///
    /// Tudo em uma única transação: pacientes, agendamentos, edições manuais
    /// e carimbo voltam exatamente ao estado retratado, e o retrato é
    /// consumido. Devolve quantos pacientes e agendamentos foram restaurados.
    pub async fn restore_sync_backup(&self, ambulatorio: &str) -> Result<(i64, i64), DbError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT patients, appointments, manual_edits, sync_timestamp FROM sync_backups WHERE ambulatorio = ?",
        )
        .bind(ambulatorio)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!("Retrato de sincronização para {}", ambulatorio))
        })?;

        let patients: Vec<Patient> = decode_json(row.try_get::<String, _>("patients")?.as_str())?;
        let appointments: Vec<Appointment> =
            decode_json(row.try_get::<String, _>("appointments")?.as_str())?;
        let manual_edits: Vec<ManualEdit> =
            decode_json(row.try_get::<String, _>("manual_edits")?.as_str())?;
        let timestamp: Option<SyncTimestamp> =
            match row.try_get::<Option<String>, _>("sync_timestamp")? {
                Some(raw) => Some(decode_json(raw.as_str())?),
                None => None,
            };

        sqlx::query("DELETE FROM manual_edits WHERE ambulatorio = ?")
            .bind(ambulatorio)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM appointments WHERE ambulatorio = ?")
            .bind(ambulatorio)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM patients WHERE ambulatorio = ?")
            .bind(ambulatorio)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_timestamps WHERE ambulatorio = ?")
            .bind(ambulatorio)
            .execute(&mut *tx)
            .await?;

        for p in &patients {
            sqlx::query(
                r#"
                INSERT INTO patients (id, created_at, updated_at, nome, cognome, tipo, ambulatorio)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(p.id.to_string())
            .bind(p.created_at)
            .bind(p.updated_at)
            .bind(&p.nome)
            .bind(&p.cognome)
            .bind(&p.tipo)
            .bind(&p.ambulatorio)
            .execute(&mut *tx)
            .await?;
        }

        for a in &appointments {
            sqlx::query(
                r#"
                INSERT INTO appointments (
                    id, patient_id, created_at, updated_at, ambulatorio, data, ora,
                    tipo, prestazioni, stato, note,
                    manually_modified, manually_modified_at, manually_modified_by,
                    last_import_key, last_import_fingerprint
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(a.id.to_string())
            .bind(a.patient_id.to_string())
            .bind(a.created_at)
            .bind(a.updated_at)
            .bind(&a.ambulatorio)
            .bind(a.data)
            .bind(a.ora)
            .bind(&a.tipo)
            .bind(encode_prestazioni(&a.prestazioni)?)
            .bind(a.stato.to_string())
            .bind(&a.note)
            .bind(a.manually_modified)
            .bind(a.manually_modified_at)
            .bind(&a.manually_modified_by)
            .bind(&a.last_import_key)
            .bind(&a.last_import_fingerprint)
            .execute(&mut *tx)
            .await?;
        }

        for edit in &manual_edits {
            sqlx::query(
                r#"
                INSERT INTO manual_edits (id, entity_type, entity_id, ambulatorio, modified_by, modified_at, sheet_identifier)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(edit.id.to_string())
            .bind(edit.entity_type.to_string())
            .bind(edit.entity_id.to_string())
            .bind(&edit.ambulatorio)
            .bind(&edit.modified_by)
            .bind(edit.modified_at)
            .bind(&edit.sheet_identifier)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(ts) = &timestamp {
            sqlx::query(
                r#"
                INSERT INTO sync_timestamps (ambulatorio, last_sync_at, last_sync_by, appointments_synced, patients_synced)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ts.ambulatorio)
            .bind(ts.last_sync_at)
            .bind(&ts.last_sync_by)
            .bind(ts.appointments_synced)
            .bind(ts.patients_synced)
            .execute(&mut *tx)
            .await?;
        }

        // O retrato é de uso único
        sqlx::query("DELETE FROM sync_backups WHERE ambulatorio = ?")
            .bind(ambulatorio)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            ambulatorio,
            patients = patients.len(),
            appointments = appointments.len(),
            "Retrato pré-aplicação restaurado"
        );
        Ok((patients.len() as i64, appointments.len() as i64))
    }
}

/// Insere um agendamento dentro de uma transação já aberta
async fn insert_appointment(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewAppointment,
) -> Result<Appointment, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO appointments (
            id, patient_id, created_at, updated_at, ambulatorio, data, ora,
            tipo, prestazioni, stato, note,
            manually_modified, last_import_key, last_import_fingerprint
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(new.patient_id.to_string())
    .bind(now)
    .bind(now)
    .bind(&new.ambulatorio)
    .bind(new.data)
    .bind(new.ora)
    .bind(&new.tipo)
    .bind(encode_prestazioni(&new.prestazioni)?)
    .bind(new.stato.to_string())
    .bind(&new.note)
    .bind(&new.last_import_key)
    .bind(&new.last_import_fingerprint)
    .execute(&mut **tx)
    .await?;

    Ok(Appointment {
        id,
        patient_id: new.patient_id,
        ambulatorio: new.ambulatorio.clone(),
        data: new.data,
        ora: new.ora,
        tipo: new.tipo.clone(),
        prestazioni: new.prestazioni.clone(),
        stato: new.stato,
        note: new.note.clone(),
        manually_modified: false,
        manually_modified_at: None,
        manually_modified_by: None,
        last_import_key: new.last_import_key.clone(),
        last_import_fingerprint: new.last_import_fingerprint.clone(),
        created_at: now,
        updated_at: now,
    })
}

/// Upsert da proveniência de edição manual
///
/// No máximo um registro por entidade, e a identidade do registro sobrevive a
/// reedições. Um novo `sheet_identifier` substitui a origem referenciada;
/// reeditar com o mesmo `sheet_identifier` só atualiza autor e momento, em
/// sintonia com `manually_modified_by`/`manually_modified_at` no agendamento.
async fn upsert_manual_edit(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entity_type: EntityType,
    entity_id: Uuid,
    ambulatorio: &str,
    modified_by: &str,
    modified_at: DateTime<Utc>,
    sheet_identifier: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO manual_edits (id, entity_type, entity_id, ambulatorio, modified_by, modified_at, sheet_identifier)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            modified_by = excluded.modified_by,
            modified_at = excluded.modified_at,
            sheet_identifier = excluded.sheet_identifier
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(entity_type.to_string())
    .bind(entity_id.to_string())
    .bind(ambulatorio)
    .bind(modified_by)
    .bind(modified_at)
    .bind(sheet_identifier)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn encode_prestazioni(prestazioni: &[String]) -> Result<String, DbError> {
    serde_json::to_string(prestazioni)
        .map_err(|e| DbError::InternalError(format!("Falha ao serializar prestazioni: {}", e)))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, DbError> {
    serde_json::to_string(value)
        .map_err(|e| DbError::InternalError(format!("Falha ao serializar retrato: {}", e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, DbError> {
    serde_json::from_str(raw)
        .map_err(|e| DbError::InternalError(format!("Falha ao desserializar retrato: {}", e)))
}
