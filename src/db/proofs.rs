//! Proof submissions.

use super::{enum_column, json_column, Database};
use crate::types::{Proof, VerificationStatus};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Verification result written to a proof row.
#[derive(Debug, Clone)]
pub struct ProofVerdict {
    pub proof_id: String,
    pub status: VerificationStatus,
    pub notes: Option<String>,
}

pub(crate) fn insert_proof_row(conn: &Connection, proof: &Proof) -> Result<()> {
    conn.execute(
        "INSERT INTO proofs (id, task_id, artifacts, proof_hash, notes, verification_status,
            verification_notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            proof.id,
            proof.task_id,
            serde_json::to_string(&proof.artifacts)?,
            proof.proof_hash,
            proof.notes,
            proof.verification_status.as_str(),
            proof.verification_notes,
            proof.created_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn set_verdict_row(conn: &Connection, verdict: &ProofVerdict) -> Result<()> {
    conn.execute(
        "UPDATE proofs SET verification_status = ?1, verification_notes = ?2 WHERE id = ?3",
        params![verdict.status.as_str(), verdict.notes, verdict.proof_id],
    )?;
    Ok(())
}

fn parse_proof_row(row: &Row) -> rusqlite::Result<Proof> {
    Ok(Proof {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        artifacts: json_column(row.get("artifacts")?)?.unwrap_or_default(),
        proof_hash: row.get("proof_hash")?,
        notes: row.get("notes")?,
        verification_status: enum_column(row.get("verification_status")?)?,
        verification_notes: row.get("verification_notes")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    /// The current proof: most recent by creation time.
    pub fn latest_proof(&self, task_id: &str) -> Result<Option<Proof>> {
        self.with_conn(|conn| {
            let proof = conn
                .query_row(
                    "SELECT * FROM proofs WHERE task_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![task_id],
                    parse_proof_row,
                )
                .optional()?;
            Ok(proof)
        })
    }

    /// All proofs for a task, oldest first.
    pub fn task_proofs(&self, task_id: &str) -> Result<Vec<Proof>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM proofs WHERE task_id = ?1 ORDER BY created_at, id")?;
            let proofs = stmt
                .query_map(params![task_id], parse_proof_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(proofs)
        })
    }
}
