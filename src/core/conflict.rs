//! Conflict detection for concurrent patches
//!
//! Decides whether an incoming patch can merge with the latest stored one
//! or overlaps it. The relay never merges content: both patches are stored
//! and broadcast either way, a conflict is just a first-class event.

use crate::core::diff::parse_hunks;
use crate::protocol::{ConflictEvent, FileDiff};

/// Closed-inclusive range of new-side line numbers touched by a hunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
}

impl LineRange {
    /// Closed-inclusive intersection test.
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Extract the new-side line ranges of a patch's hunks. A patch with no
/// parseable hunks counts as touching the whole file.
pub fn new_side_ranges(patch: &str) -> Vec<LineRange> {
    let hunks = parse_hunks(patch).unwrap_or_default();
    if hunks.is_empty() {
        return vec![LineRange {
            start: 0,
            end: u64::MAX,
        }];
    }
    hunks
        .iter()
        .map(|h| {
            let start = h.new_start as u64;
            let len = h.new_len.max(1) as u64;
            LineRange {
                start,
                end: start + len - 1,
            }
        })
        .collect()
}

/// Whether any range of one patch intersects any range of the other.
pub fn patches_overlap(a: &str, b: &str) -> bool {
    let ranges_a = new_side_ranges(a);
    let ranges_b = new_side_ranges(b);
    ranges_a
        .iter()
        .any(|ra| ranges_b.iter().any(|rb| ra.overlaps(rb)))
}

/// Synthesize the conflict-copy name `<base>.conflict-<ts>.<ext>`. The
/// extension defaults to `ts` for extensionless paths.
pub fn conflict_file_name(file: &str, now_ms: i64) -> String {
    let (base, ext) = match file.rsplit_once('.') {
        // A dot inside the final path component is an extension split; a
        // dot only in a parent directory is not.
        Some((base, ext)) if !ext.contains('/') && !base.ends_with('/') && !base.is_empty() => {
            (base, ext)
        }
        _ => (file, "ts"),
    };
    format!("{base}.conflict-{now_ms}.{ext}")
}

/// Outcome of evaluating an incoming diff against the latest stored one.
#[derive(Clone, Debug)]
pub enum MergeDecision {
    /// Disjoint edits; both diffs flow through in arrival order.
    Merged,
    /// Overlapping edits; the event is persisted and broadcast.
    Conflict(ConflictEvent),
}

impl MergeDecision {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeDecision::Conflict(_))
    }
}

/// Compare the most recent stored diff with a newly received one. Only
/// called when the incoming `previous_version` disagrees with the relay's
/// current hash for the file.
pub fn evaluate(existing: &FileDiff, incoming: &FileDiff, now_ms: i64) -> MergeDecision {
    if !patches_overlap(&existing.patch, &incoming.patch) {
        return MergeDecision::Merged;
    }
    MergeDecision::Conflict(ConflictEvent {
        id: None,
        file: incoming.file.clone(),
        conflict_file: conflict_file_name(&incoming.file, now_ms),
        author_a: existing.author.clone(),
        author_b: incoming.author.clone(),
        timestamp: now_ms,
        resolved: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::make_patch;
    use crate::protocol::AuthorType;

    fn diff_for(file: &str, patch: &str, author: &str) -> FileDiff {
        FileDiff {
            id: None,
            file: file.into(),
            patch: patch.into(),
            author: author.into(),
            author_type: AuthorType::Human,
            timestamp: 0,
            version: "v1".into(),
            previous_version: "v0".into(),
            compressed: false,
        }
    }

    #[test]
    fn test_range_overlap_math() {
        let a = LineRange { start: 1, end: 4 };
        let b = LineRange { start: 4, end: 9 };
        let c = LineRange { start: 5, end: 9 };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_empty_patch_counts_as_whole_file() {
        let ranges = new_side_ranges("");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, u64::MAX);
        assert!(patches_overlap("", "@@ -1,2 +1,2 @@\n a\n-b\n+c\n"));
    }

    #[test]
    fn test_disjoint_edits_merge() {
        let base: String = (1..=20).map(|i| format!("line{i}\n")).collect();
        let top = base.replacen("line2\n", "line2 edited\n", 1);
        let bottom = base.replacen("line19\n", "line19 edited\n", 1);
        let decision = evaluate(
            &diff_for("a.txt", &make_patch(&base, &top), "alice"),
            &diff_for("a.txt", &make_patch(&base, &bottom), "bob"),
            1_000,
        );
        assert!(!decision.is_conflict());
    }

    #[test]
    fn test_same_line_edits_conflict() {
        let base = "line1\nline2\nline3\n";
        let a = "line1\nTWO-A\nline3\n";
        let b = "line1\nTWO-B\nline3\n";
        let decision = evaluate(
            &diff_for("foo.txt", &make_patch(base, a), "alice"),
            &diff_for("foo.txt", &make_patch(base, b), "bob"),
            1_234,
        );
        match decision {
            MergeDecision::Conflict(event) => {
                assert_eq!(event.author_a, "alice");
                assert_eq!(event.author_b, "bob");
                assert_eq!(event.conflict_file, "foo.conflict-1234.txt");
                assert!(!event.resolved);
            }
            MergeDecision::Merged => panic!("expected a conflict"),
        }
    }

    #[test]
    fn test_conflict_file_name_shapes() {
        assert_eq!(
            conflict_file_name("src/app.ts", 99),
            "src/app.conflict-99.ts"
        );
        assert_eq!(conflict_file_name("Makefile", 99), "Makefile.conflict-99.ts");
        assert_eq!(
            conflict_file_name("a.dir/readme", 99),
            "a.dir/readme.conflict-99.ts"
        );
    }
}
