//! Sistema de migrações para banco de dados
//!
//! Este módulo gerencia as migrações do banco de dados SQLite

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{error, info};

/// Lista de migrações SQL a serem aplicadas
const MIGRATIONS: &[&str] = &[
    // 001_initial_schema.sql
    r#"
    -- Tabela de pacientes
    CREATE TABLE IF NOT EXISTS patients (
        id TEXT PRIMARY KEY NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        nome TEXT NOT NULL,
        cognome TEXT NOT NULL,
        tipo TEXT NOT NULL,
        ambulatorio TEXT NOT NULL
    );

    -- Tabela de agendamentos
    CREATE TABLE IF NOT EXISTS appointments (
        id TEXT PRIMARY KEY NOT NULL,
        patient_id TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        ambulatorio TEXT NOT NULL,
        data DATE NOT NULL,
        ora TIME NOT NULL,
        tipo TEXT NOT NULL,
        prestazioni TEXT NOT NULL DEFAULT '[]', -- JSON com a lista de prestações
        stato TEXT NOT NULL CHECK (stato IN ('da_fare', 'effettuato', 'non_presentato')),
        note TEXT,
        manually_modified BOOLEAN NOT NULL DEFAULT 0,
        manually_modified_at TIMESTAMP,
        manually_modified_by TEXT,
        last_import_key TEXT,
        last_import_fingerprint TEXT,
        FOREIGN KEY (patient_id) REFERENCES patients (id) ON DELETE CASCADE
    );

    -- Índices para otimização
    CREATE INDEX IF NOT EXISTS idx_patients_ambulatorio ON patients (ambulatorio);
    CREATE INDEX IF NOT EXISTS idx_patients_nome ON patients (ambulatorio, cognome, nome);
    CREATE INDEX IF NOT EXISTS idx_appointments_patient_id ON appointments (patient_id);
    CREATE INDEX IF NOT EXISTS idx_appointments_periodo ON appointments (ambulatorio, data);
    CREATE INDEX IF NOT EXISTS idx_appointments_stato ON appointments (stato);
    "#,
    // 002_sync_tables.sql
    r#"
    -- Proveniência de edições manuais: no máximo um registro por entidade,
    -- um novo registro substitui o anterior
    CREATE TABLE IF NOT EXISTS manual_edits (
        id TEXT PRIMARY KEY NOT NULL,
        entity_type TEXT NOT NULL CHECK (entity_type IN ('appointment', 'patient')),
        entity_id TEXT NOT NULL UNIQUE,
        ambulatorio TEXT NOT NULL,
        modified_by TEXT NOT NULL,
        modified_at TIMESTAMP NOT NULL,
        sheet_identifier TEXT NOT NULL
    );

    -- Carimbo da última sincronização: uma linha por ambulatório, upsert
    CREATE TABLE IF NOT EXISTS sync_timestamps (
        ambulatorio TEXT PRIMARY KEY NOT NULL,
        last_sync_at TIMESTAMP NOT NULL,
        last_sync_by TEXT NOT NULL,
        appointments_synced INTEGER NOT NULL DEFAULT 0,
        patients_synced INTEGER NOT NULL DEFAULT 0
    );

    -- Índices para otimização
    CREATE INDEX IF NOT EXISTS idx_manual_edits_ambulatorio ON manual_edits (ambulatorio, modified_at);
    "#,
    // 003_sync_backups.sql
    r#"
    -- Retrato do ambulatório tirado antes de cada aplicação: um único slot
    -- por ambulatório, consumido pelo rollback
    CREATE TABLE IF NOT EXISTS sync_backups (
        ambulatorio TEXT PRIMARY KEY NOT NULL,
        created_at TIMESTAMP NOT NULL,
        patients TEXT NOT NULL,       -- JSON com os pacientes
        appointments TEXT NOT NULL,   -- JSON com os agendamentos
        manual_edits TEXT NOT NULL,   -- JSON com as edições manuais
        sync_timestamp TEXT,          -- JSON com o carimbo, se havia
        patients_count INTEGER NOT NULL DEFAULT 0,
        appointments_count INTEGER NOT NULL DEFAULT 0
    );
    "#,
];

/// Executa todas as migrações pendentes no banco de dados
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Aplicando migrações de banco de dados...");

    // Obter a versão atual do banco de dados
    let mut version: i64 = 0;
    match sqlx::query_scalar("PRAGMA user_version").fetch_one(pool).await {
        Ok(v) => version = v,
        Err(e) => {
            error!("Erro ao obter versão do banco: {}", e);
            // Continuar mesmo assim, pois pode ser a primeira execução
        }
    }

    info!("Versão atual do banco: {}", version);

    // Aplicar cada migração pendente sequencialmente
    for (i, migration_sql) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as i64;

        // Pular migrações já aplicadas
        if migration_version <= version {
            info!("Migração {} já aplicada", migration_version);
            continue;
        }

        info!("Aplicando migração {}...", migration_version);

        // Executar em uma transação para garantir atomicidade
        let mut transaction = pool.begin().await.context(format!(
            "Falha ao iniciar transação para migração {}",
            migration_version
        ))?;

        // Executar os comandos SQL
        sqlx::query(migration_sql)
            .execute(&mut *transaction)
            .await
            .context(format!("Falha ao executar migração {}", migration_version))?;

        // Atualizar versão do banco
        sqlx::query(&format!("PRAGMA user_version = {}", migration_version))
            .execute(&mut *transaction)
            .await
            .context(format!("Falha ao atualizar versão para {}", migration_version))?;

        // Commit da transação
        transaction.commit().await.context(format!(
            "Falha ao confirmar transação para migração {}",
            migration_version
        ))?;

        info!("Migração {} aplicada com sucesso", migration_version);
    }

    info!("Migrações concluídas. Versão atual: {}", MIGRATIONS.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_migrations() -> Result<()> {
        // Usar diretório temporário para testes
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("test_migrations.db");

        // Conectar
        let conn_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(conn_options).await?;

        // Aplicar migrações (duas vezes: a segunda deve ser um no-op)
        run_migrations(&pool).await?;
        run_migrations(&pool).await?;

        // Verificar versão do banco
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await?;

        assert_eq!(version, MIGRATIONS.len() as i64);

        // Verificar se tabelas foram criadas
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&pool)
        .await?;

        assert!(tables.contains(&"patients".to_string()));
        assert!(tables.contains(&"appointments".to_string()));
        assert!(tables.contains(&"manual_edits".to_string()));
        assert!(tables.contains(&"sync_timestamps".to_string()));
        assert!(tables.contains(&"sync_backups".to_string()));

        Ok(())
    }
}
