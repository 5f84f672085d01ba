//! Definições de erro do serviço de sincronização

use serde::Serialize;
use thiserror::Error;

use common_db::DbError;

/// Erros de leitura da fonte externa
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("Planilha indisponível: {0}")]
    Unavailable(String),

    #[error("Conteúdo da planilha inválido: {0}")]
    Malformed(String),
}

/// Erros que abortam uma chamada inteira de análise ou aplicação
///
/// Falhas de registros individuais durante a aplicação não passam por aqui:
/// são degradadas para sucesso parcial e reportadas em `per_record_failures`.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Outra sessão está em andamento para o mesmo ambulatório.
    /// Recuperável: basta tentar de novo mais tarde.
    #[error("Sincronização já em andamento para o ambulatório {0}")]
    SessionBusy(String),

    /// A fonte externa não pôde ser lida: a análise falha por inteiro,
    /// nunca parcialmente
    #[error("Fonte externa indisponível: {0}")]
    SheetUnavailable(#[from] SheetError),

    /// Chave natural duplicada no armazenamento. Fatal para a chamada,
    /// nunca reparado automaticamente.
    #[error("Integridade de dados violada: {0}")]
    DataIntegrity(String),

    /// Falha de armazenamento irrecuperável
    #[error("Erro de armazenamento: {0}")]
    Storage(#[from] DbError),
}

/// Falha da unidade atômica de um único registro durante a aplicação
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    /// Chave natural do registro que falhou
    pub natural_key: String,
    /// Motivo da falha
    pub reason: String,
}
