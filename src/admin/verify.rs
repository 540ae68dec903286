use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_cache;
use crate::admin::Result;
use crate::cache::LocalCache;
use crate::serialization::{peek_closure, recompute_id};
use crate::types::ObjectId;

const MAX_FINDINGS: usize = 32;
/// Ids per presence lookup when checking closures.
const LOOKUP_CHUNK: usize = 500;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Re-hash every record and compare it with its key.
    Fast,
    /// Additionally check that every closure entry is present in the cache.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Non-critical issue, such as a graph that is only partially cached.
    Warning,
    /// A record that does not match its content address.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// How serious the finding is.
    pub severity: VerifySeverity,
    /// Human-readable description.
    pub message: String,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Records read from the cache.
    pub records_scanned: u64,
    /// Records whose recomputed hash differs from their key.
    pub hash_mismatches: u64,
    /// Records that are not a JSON object or carry an unreadable closure.
    pub malformed: u64,
    /// Distinct closure ids referenced by the scanned records.
    pub closure_ids: u64,
    /// Closure ids absent from the cache.
    pub missing_closure_ids: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Depth the run was performed at.
    pub level: VerifyLevel,
    /// Whether verification found no errors. Missing closure ids are
    /// warnings: a cache may legitimately hold part of a graph.
    pub success: bool,
    /// Findings, capped per run.
    pub findings: Vec<VerifyFinding>,
    /// Totals over every record.
    pub counts: VerifyCounts,
}

/// Verifies the records of an open cache.
pub fn verify_cache(cache: &dyn LocalCache, level: VerifyLevel) -> Result<VerifyReport> {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let mut referenced: BTreeSet<ObjectId> = BTreeSet::new();
    let mut errors = 0u64;

    for entry in cache.enumerate() {
        let (id, json) = entry?;
        counts.records_scanned += 1;
        match recompute_id(&json) {
            Ok(actual) if actual == id => {}
            Ok(actual) => {
                counts.hash_mismatches += 1;
                errors += 1;
                push(
                    &mut findings,
                    VerifySeverity::Error,
                    format!("record {id} hashes to {actual}"),
                );
            }
            Err(err) => {
                counts.malformed += 1;
                errors += 1;
                push(
                    &mut findings,
                    VerifySeverity::Error,
                    format!("record {id} is not a JSON object: {err}"),
                );
                continue;
            }
        }
        if matches!(level, VerifyLevel::Full) {
            match peek_closure(&json) {
                Ok(closure) => referenced.extend(closure.ids().cloned()),
                Err(err) => {
                    counts.malformed += 1;
                    errors += 1;
                    push(
                        &mut findings,
                        VerifySeverity::Error,
                        format!("record {id} has an unreadable closure: {err}"),
                    );
                }
            }
        }
    }

    if matches!(level, VerifyLevel::Full) {
        counts.closure_ids = referenced.len() as u64;
        let referenced: Vec<ObjectId> = referenced.into_iter().collect();
        for chunk in referenced.chunks(LOOKUP_CHUNK) {
            let present = cache.has_many(chunk)?;
            for id in chunk.iter().filter(|id| !present.contains(*id)) {
                counts.missing_closure_ids += 1;
                push(
                    &mut findings,
                    VerifySeverity::Warning,
                    format!("closure entry {id} is not cached"),
                );
            }
        }
    }

    Ok(VerifyReport {
        level,
        success: errors == 0,
        findings,
        counts,
    })
}

/// Verifies the integrity of the cache file at `path`.
///
/// # Errors
///
/// Returns an error if the cache cannot be opened or read.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let cache = open_cache(path.as_ref(), opts)?;
    verify_cache(&cache, level)
}

fn push(findings: &mut Vec<VerifyFinding>, severity: VerifySeverity, message: String) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding { severity, message });
    }
}
