//! Duplicate-pair detection over active patients.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    normalize::{is_email_key, is_phone_key, normalize_email, normalize_full_name, normalize_phone},
    similarity::NameSimilarity,
};
use crate::models::{MergeCandidate, MergeStrategy, PatientIdentity};

#[derive(Debug, Clone)]
struct Normalized {
    patient_id: Uuid,
    created_at: DateTime<Utc>,
    full_name: String,
    phones: BTreeSet<String>,
    email: Option<String>,
}

impl From<&PatientIdentity> for Normalized {
    fn from(p: &PatientIdentity) -> Self {
        Normalized {
            patient_id: p.patient_id,
            created_at: p.created_at,
            full_name: normalize_full_name(&p.first_name, &p.last_name),
            phones: p
                .phones
                .iter()
                .map(|raw| normalize_phone(raw))
                .filter(|s| is_phone_key(s))
                .collect(),
            email: p
                .email
                .as_deref()
                .map(normalize_email)
                .filter(|s| is_email_key(s)),
        }
    }
}

/// Unordered pair, oriented so the older record is the merge target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PairKey {
    target_id: Uuid,
    source_id: Uuid,
}

fn orient(a: &Normalized, b: &Normalized) -> PairKey {
    let a_first = (a.created_at, a.patient_id) <= (b.created_at, b.patient_id);
    if a_first {
        PairKey {
            target_id: a.patient_id,
            source_id: b.patient_id,
        }
    } else {
        PairKey {
            target_id: b.patient_id,
            source_id: a.patient_id,
        }
    }
}

/// Runs `strategies` over `patients` and returns one candidate per pair.
///
/// `patients` must already be restricted to active records. `name_threshold`
/// applies to `name_trgm`; `min_confidence`, when set, filters every strategy.
pub fn find_candidates(
    patients: &[PatientIdentity],
    strategies: &[MergeStrategy],
    name_threshold: f64,
    min_confidence: Option<f64>,
    similarity: &dyn NameSimilarity,
) -> Vec<MergeCandidate> {
    let normalized: Vec<Normalized> = patients.iter().map(Normalized::from).collect();

    // first strategy to claim a pair keeps it unless a later one scores higher
    let mut best: HashMap<PairKey, (MergeStrategy, f64)> = HashMap::new();
    for &strategy in MergeStrategy::DETECTABLE
        .iter()
        .filter(|s| strategies.contains(*s))
    {
        let pairs = match strategy {
            MergeStrategy::PhoneExact => {
                exact_pairs(&normalized, |p| p.phones.iter().map(String::as_str).collect())
            }
            MergeStrategy::EmailExact => {
                exact_pairs(&normalized, |p| p.email.as_deref().into_iter().collect())
            }
            MergeStrategy::NameTrgm => name_pairs(&normalized, name_threshold, similarity),
            MergeStrategy::Manual | MergeStrategy::Other => continue,
        };
        for (key, confidence) in pairs {
            if min_confidence.is_some_and(|min| confidence < min) {
                continue;
            }
            best.entry(key)
                .and_modify(|slot| {
                    if confidence > slot.1 {
                        *slot = (strategy, confidence);
                    }
                })
                .or_insert((strategy, confidence));
        }
    }

    let mut out: Vec<MergeCandidate> = best
        .into_iter()
        .map(|(key, (strategy, confidence))| MergeCandidate {
            source_id: key.source_id,
            target_id: key.target_id,
            strategy,
            confidence,
        })
        .collect();

    out.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.target_id.cmp(&b.target_id))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    out
}

/// Every pair sharing at least one non-empty key, confidence 1.0. A patient
/// may carry several keys; each pair is reported once.
fn exact_pairs<F>(patients: &[Normalized], keys_of: F) -> Vec<(PairKey, f64)>
where
    F: Fn(&Normalized) -> Vec<&str>,
{
    let mut groups: BTreeMap<&str, Vec<&Normalized>> = BTreeMap::new();
    for p in patients {
        for k in keys_of(p) {
            groups.entry(k).or_default().push(p);
        }
    }

    let mut pairs = BTreeSet::new();
    for members in groups.values().filter(|m| m.len() > 1) {
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                if a.patient_id != b.patient_id {
                    pairs.insert(orient(a, b));
                }
            }
        }
    }
    pairs.into_iter().map(|key| (key, 1.0)).collect()
}

/// Fuzzy name pairs at or above `threshold`. Only pairs that share at least
/// one blocking key are scored.
fn name_pairs(
    patients: &[Normalized],
    threshold: f64,
    similarity: &dyn NameSimilarity,
) -> Vec<(PairKey, f64)> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, p) in patients.iter().enumerate() {
        if p.full_name.is_empty() {
            continue;
        }
        for key in similarity.blocking_keys(&p.full_name) {
            index.entry(key).or_default().push(i);
        }
    }

    let mut compared: BTreeSet<(usize, usize)> = BTreeSet::new();
    for bucket in index.values() {
        for (n, &i) in bucket.iter().enumerate() {
            for &j in &bucket[n + 1..] {
                if i != j {
                    compared.insert((i.min(j), i.max(j)));
                }
            }
        }
    }

    compared
        .into_iter()
        .filter_map(|(i, j)| {
            let (a, b) = (&patients[i], &patients[j]);
            let score = similarity.similarity(&a.full_name, &b.full_name).clamp(0.0, 1.0);
            (score >= threshold && score > 0.0).then(|| (orient(a, b), score))
        })
        .collect()
}
