//! Detecção de divergências entre candidato e agendamento existente
//!
//! Dado um candidato e o registro casado (se houver), decide o que a fase de
//! aplicação pode fazer com segurança:
//! - sem casamento → criação
//! - conteúdo semanticamente igual → nada a fazer
//! - registro nunca tocado por um humano → atualização segura (a planilha é
//!   autoritativa até alguém editar localmente)
//! - registro editado manualmente e a linha da planilha mudou desde a última
//!   importação → conflito, a resolver por um humano
//!
//! Uma linha de planilha que não mudou desde a última importação nunca gera
//! conflito, mesmo que o registro local tenha divergido: a planilha não tem
//! nada de novo a dizer. A divergência é detectada comparando a impressão
//! digital do candidato com a gravada na última importação.

use std::collections::BTreeSet;

use common_db::models::AppointmentWithPatient;

use crate::sheet::{normalize_note, NormalizedCandidate};

/// Resultado da classificação de um candidato
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Sem casamento: o registro será criado
    Create,
    /// Conteúdo igual (ou planilha sem novidade): nada a fazer
    NoOp,
    /// Registro pristino de importação, conteúdo diferente: sobrescrever
    SafeUpdate { changed: Vec<&'static str> },
    /// Registro editado manualmente e planilha mudou: decisão humana
    Conflict { changed: Vec<&'static str> },
}

/// Classifica um candidato em relação ao registro casado
pub fn classify(
    candidate: &NormalizedCandidate,
    matched: Option<&AppointmentWithPatient>,
) -> Classification {
    let Some(existing) = matched else {
        return Classification::Create;
    };

    let changed = diverging_fields(candidate, existing);
    if changed.is_empty() {
        // Histórico de modificação sozinho não gera conflito: só divergência
        return Classification::NoOp;
    }

    if !existing.appointment.manually_modified {
        return Classification::SafeUpdate { changed };
    }

    // Registro protegido por edição manual: a linha da planilha só entra em
    // conflito se mudou desde a última importação
    let sheet_unchanged = existing
        .appointment
        .last_import_fingerprint
        .as_deref()
        .map(|fp| fp == candidate.fingerprint)
        .unwrap_or(false);

    if sheet_unchanged {
        Classification::NoOp
    } else {
        Classification::Conflict { changed }
    }
}

/// Campos comparáveis que divergem entre candidato e registro existente
///
/// As prestações são comparadas como conjunto, não como lista ordenada; a
/// nota-marcador da planilha é excluída da comparação.
fn diverging_fields(
    candidate: &NormalizedCandidate,
    existing: &AppointmentWithPatient,
) -> Vec<&'static str> {
    let mut changed = Vec::new();

    if candidate.record.tipo != existing.appointment.tipo {
        changed.push("tipo");
    }

    let candidate_set: BTreeSet<&str> =
        candidate.record.prestazioni.iter().map(|p| p.as_str()).collect();
    let existing_set: BTreeSet<&str> = existing
        .appointment
        .prestazioni
        .iter()
        .map(|p| p.as_str())
        .collect();
    if candidate_set != existing_set {
        changed.push("prestazioni");
    }

    let existing_note = normalize_note(existing.appointment.note.clone());
    if candidate.record.note != existing_note {
        changed.push("note");
    }

    changed
}
