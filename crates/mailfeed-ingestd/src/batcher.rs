//! Domain resolution, grouping, and greedy batch selection.
//!
//! The batcher is a pure pass over one scan's worth of filenames: resolve
//! each file to its tenant domain, group, chunk at [`BATCH_MAX`], and pick
//! chunks largest-first until the queue's remaining capacity is spent.
//! Larger chunks amortize the vector-import round-trip, so an under-filled
//! chunk is only chosen when no full chunk is left. Ties are broken by
//! ascending domain name to keep selection deterministic.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Maximum files per batch.
pub const BATCH_MAX: usize = 50;

/// A selected batch, still addressed by `wait/` filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub domain: String,
    pub files: Vec<String>,
}

/// A file whose domain could not be resolved by any step; routed straight
/// to `buggy/` without ever entering `run/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unroutable {
    pub file: String,
    /// Best-effort identity recovered from the record, for the ledger row.
    pub mail_id: Option<String>,
    pub user_id: Option<String>,
    pub received_time: Option<String>,
    pub reason: String,
}

/// Result of one planning pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub selected: Vec<PlannedBatch>,
    pub unroutable: Vec<Unroutable>,
}

/// Resolve domains, group, chunk, and select up to `capacity` batches.
#[must_use]
pub fn plan(wait_dir: &Path, names: &[String], capacity: usize) -> BatchPlan {
    let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut unroutable = Vec::new();

    for name in names {
        match resolve_domain(wait_dir, name) {
            Ok(domain) => by_domain.entry(domain).or_default().push(name.clone()),
            Err(entry) => unroutable.push(entry),
        }
    }

    let mut candidates: Vec<PlannedBatch> = Vec::new();
    for (domain, files) in &by_domain {
        for chunk in files.chunks(BATCH_MAX) {
            candidates.push(PlannedBatch {
                domain: domain.clone(),
                files: chunk.to_vec(),
            });
        }
    }

    // Largest first; equal sizes fall back to domain order. The sort is
    // stable, so a domain's own chunks keep their scan order.
    candidates.sort_by(|a, b| {
        b.files
            .len()
            .cmp(&a.files.len())
            .then_with(|| a.domain.cmp(&b.domain))
    });
    candidates.truncate(capacity);

    BatchPlan {
        selected: candidates,
        unroutable,
    }
}

/// Resolve a file's domain: filename hints first, record contents last.
fn resolve_domain(wait_dir: &Path, name: &str) -> Result<String, Unroutable> {
    if let Some(domain) = domain_from_filename(name) {
        return Ok(domain);
    }

    match domain_from_record(&wait_dir.join(name)) {
        (Some(domain), _) => Ok(domain),
        (None, hints) => Err(Unroutable {
            file: name.to_owned(),
            mail_id: hints.mail_id,
            user_id: hints.user_id,
            received_time: hints.received_time,
            reason: "no domain in filename, record, or user_id".to_owned(),
        }),
    }
}

/// Extract a domain hint from the filename.
///
/// Preferred form `*__domain=<domain>__*.json`; accepted fallback
/// `*@<domain>*.json`. A hint running into the `.json` extension has the
/// extension stripped.
#[must_use]
pub fn domain_from_filename(name: &str) -> Option<String> {
    static DOMAIN_RE: OnceLock<Regex> = OnceLock::new();
    static AT_RE: OnceLock<Regex> = OnceLock::new();

    let domain_re = DOMAIN_RE
        .get_or_init(|| Regex::new(r"domain=([A-Za-z0-9.-]+)").expect("static regex compiles"));
    let at_re =
        AT_RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9.-]+)").expect("static regex compiles"));

    for re in [domain_re, at_re] {
        if let Some(captures) = re.captures(name) {
            let raw = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let trimmed = raw
                .strip_suffix(".json")
                .unwrap_or(raw)
                .trim_end_matches('.');
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    None
}

#[derive(Debug, Default)]
struct RecordHints {
    mail_id: Option<String>,
    user_id: Option<String>,
    received_time: Option<String>,
}

/// Best-effort read of the record itself: explicit `domain` field, or the
/// host part of `user_id`. Returns whatever identity fields were readable
/// so an unroutable file still gets a ledger row when possible.
fn domain_from_record(path: &Path) -> (Option<String>, RecordHints) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return (None, RecordHints::default());
    };
    let Ok(record) = serde_json::from_str::<Value>(&raw) else {
        return (None, RecordHints::default());
    };

    let field = |name: &str| {
        record
            .get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    let hints = RecordHints {
        mail_id: field("mail_id"),
        user_id: field("user_id"),
        received_time: field("received_time"),
    };

    let domain = field("domain").or_else(|| {
        hints
            .user_id
            .as_deref()
            .and_then(|user| user.split_once('@'))
            .map(|(_, host)| host.to_owned())
            .filter(|host| !host.is_empty())
    });
    (domain, hints)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(specs: &[(&str, usize)]) -> Vec<String> {
        let mut out = Vec::new();
        for (domain, count) in specs {
            for i in 0..*count {
                out.push(format!("mail_{i:04}__domain={domain}__.json"));
            }
        }
        out
    }

    #[test]
    fn filename_domain_hint_is_preferred() {
        assert_eq!(
            domain_from_filename("mail_0001__domain=ex.com__.json"),
            Some("ex.com".to_owned())
        );
    }

    #[test]
    fn at_fallback_applies_without_domain_hint() {
        assert_eq!(
            domain_from_filename("alice@corp.example.json"),
            Some("corp.example".to_owned())
        );
    }

    #[test]
    fn extension_is_stripped_from_trailing_hints() {
        assert_eq!(
            domain_from_filename("mail_domain=ex.com.json"),
            Some("ex.com".to_owned())
        );
        assert_eq!(
            domain_from_filename("bob@ex.com.json"),
            Some("ex.com".to_owned())
        );
    }

    #[test]
    fn undecorated_names_have_no_hint() {
        assert_eq!(domain_from_filename("m1.json"), None);
        assert_eq!(domain_from_filename("domain=.json"), None);
    }

    #[test]
    fn groups_are_chunked_at_batch_max() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plan = plan(dir.path(), &names(&[("a.com", 51)]), 10);
        assert_eq!(plan.selected.len(), 2);
        assert_eq!(plan.selected[0].files.len(), 50);
        assert_eq!(plan.selected[1].files.len(), 1);
        assert!(plan.unroutable.is_empty());
    }

    #[test]
    fn selection_is_greedy_largest_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        // 60 + 60 files, capacity 2: one full batch per domain wins the
        // cycle; the two 10-file remainders wait for the next one.
        let plan = plan(dir.path(), &names(&[("a.com", 60), ("b.com", 60)]), 2);
        assert_eq!(plan.selected.len(), 2);
        assert_eq!(plan.selected[0].domain, "a.com");
        assert_eq!(plan.selected[0].files.len(), 50);
        assert_eq!(plan.selected[1].domain, "b.com");
        assert_eq!(plan.selected[1].files.len(), 50);
    }

    #[test]
    fn underfilled_chunks_lose_to_full_ones() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plan = plan(dir.path(), &names(&[("small.com", 3), ("big.com", 50)]), 1);
        assert_eq!(plan.selected.len(), 1);
        assert_eq!(plan.selected[0].domain, "big.com");
    }

    #[test]
    fn equal_sizes_tie_break_on_domain_name() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plan = plan(dir.path(), &names(&[("zeta.com", 5), ("alpha.com", 5)]), 1);
        assert_eq!(plan.selected[0].domain, "alpha.com");
    }

    #[test]
    fn zero_capacity_selects_nothing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plan = plan(dir.path(), &names(&[("a.com", 10)]), 0);
        assert!(plan.selected.is_empty());
    }

    #[test]
    fn record_fallback_reads_domain_field() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join("m1.json"),
            br#"{"mail_id":"m1","user_id":"a@ex.com","domain":"override.net","received_time":"2025-01-01T00:00:00"}"#,
        )
        .expect("fixture");

        let plan = plan(dir.path(), &["m1.json".to_owned()], 5);
        assert_eq!(plan.selected.len(), 1);
        assert_eq!(plan.selected[0].domain, "override.net");
    }

    #[test]
    fn record_fallback_derives_domain_from_user_id() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join("m2.json"),
            br#"{"mail_id":"m2","user_id":"b@host.org","received_time":"2025-01-01T00:00:00"}"#,
        )
        .expect("fixture");

        let plan = plan(dir.path(), &["m2.json".to_owned()], 5);
        assert_eq!(plan.selected[0].domain, "host.org");
    }

    #[test]
    fn unresolvable_files_surface_with_hints() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join("m3.json"),
            br#"{"mail_id":"m3","user_id":"no-at-sign","received_time":"2025-01-01T00:00:00"}"#,
        )
        .expect("fixture");
        std::fs::write(dir.path().join("m4.json"), b"not json at all").expect("fixture");

        let plan = plan(
            dir.path(),
            &["m3.json".to_owned(), "m4.json".to_owned()],
            5,
        );
        assert!(plan.selected.is_empty());
        assert_eq!(plan.unroutable.len(), 2);

        let m3 = plan.unroutable.iter().find(|u| u.file == "m3.json").unwrap();
        assert_eq!(m3.mail_id.as_deref(), Some("m3"));
        assert_eq!(m3.user_id.as_deref(), Some("no-at-sign"));

        let m4 = plan.unroutable.iter().find(|u| u.file == "m4.json").unwrap();
        assert_eq!(m4.mail_id, None);
    }
}
