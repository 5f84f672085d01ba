//! Sheet Bridge - Micro-serviço de sincronização entre a planilha e a agenda
//!
//! Este serviço implementa:
//! - Casamento por chave natural entre linhas da planilha e agendamentos
//! - Detecção de divergências e classificação (criação, atualização segura,
//!   conflito)
//! - Proteção de edições manuais: nada que um humano alterou é sobrescrito
//!   em silêncio
//! - Sessões de sincronização por ambulatório, com análise em duas fases
//!   (analisar, resolver, aplicar) e carimbo durável por inquilino

pub mod config;
pub mod detector;
pub mod error;
pub mod http;
pub mod matcher;
pub mod session;
pub mod sheet;

mod apply;

/// Informações de build geradas pelo `built`
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
