//! Configuração do serviço via variáveis de ambiente

use anyhow::{Context, Result};
use std::net::SocketAddr;

use common_db::DbConfig;

/// Configuração completa do serviço
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Conexão com o banco de dados da agenda
    pub db: DbConfig,
    /// Endereço de escuta HTTP
    pub bind_addr: SocketAddr,
    /// Caminho do arquivo JSON normalizado depositado pelo pipeline de
    /// importação da planilha
    pub sheet_path: String,
}

impl AppConfig {
    /// Carrega a configuração do ambiente, com padrões de desenvolvimento
    pub fn from_env() -> Result<Self> {
        let db_path =
            std::env::var("BRIDGE_DB_PATH").unwrap_or_else(|_| "data/clinic.db".to_string());
        let max_connections = std::env::var("BRIDGE_DB_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .context("BRIDGE_DB_MAX_CONNECTIONS inválido")?
            .unwrap_or(5);

        let bind_addr = std::env::var("BRIDGE_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8001".to_string())
            .parse::<SocketAddr>()
            .context("BRIDGE_BIND_ADDR inválido")?;

        let sheet_path = std::env::var("BRIDGE_SHEET_PATH")
            .unwrap_or_else(|_| "data/sheet_export.json".to_string());

        Ok(Self {
            db: DbConfig {
                db_path,
                max_connections,
            },
            bind_addr,
            sheet_path,
        })
    }
}
