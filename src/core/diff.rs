//! Diff engine wrapper
//!
//! Produces unified-hunk text patches, applies them best-effort with
//! per-hunk success reporting, and computes the short content fingerprints
//! used as version identifiers throughout the protocol.
//!
//! Patches are generated by `similar` and carry only `@@ -a,b +c,d @@`
//! hunks (no file headers). Application works on newline-inclusive line
//! tokens so that trailing-newline changes survive a round trip.

use crate::core::error::{Result, SyncError};
use sha2::{Digest, Sha256};
use similar::TextDiff;

/// Context lines emitted around each hunk.
const CONTEXT_RADIUS: usize = 3;

/// One line of a parsed patch. The payload keeps its trailing newline
/// except for a final line flagged by a `\ No newline at end of file`
/// marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A single unified hunk.
#[derive(Debug, Clone)]
pub struct Hunk {
    /// 1-based first line on the old side (0 with `old_len == 0` means
    /// insert at the top).
    pub old_start: usize,
    pub old_len: usize,
    /// 1-based first line on the new side.
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<PatchLine>,
}

impl Hunk {
    /// Old-side lines (context + removals) in order.
    fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            PatchLine::Context(s) | PatchLine::Remove(s) => Some(s.as_str()),
            PatchLine::Add(_) => None,
        })
    }

    /// New-side lines (context + additions) in order.
    fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            PatchLine::Context(s) | PatchLine::Add(s) => Some(s.as_str()),
            PatchLine::Remove(_) => None,
        })
    }
}

/// Outcome of a best-effort patch application.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The patched document. On partial failure this is the result of the
    /// hunks that did apply.
    pub result: String,
    /// True iff every hunk applied cleanly.
    pub ok: bool,
    /// Per-hunk success bits, in patch order.
    pub hunks_ok: Vec<bool>,
}

/// 16-hex version fingerprint: first 64 bits of SHA-256 over UTF-8 bytes.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Fingerprint inequality, used to filter no-op saves.
pub fn has_changed(a: &str, b: &str) -> bool {
    fingerprint(a) != fingerprint(b)
}

/// Produce a unified patch turning `old` into `new`. Empty when the texts
/// are identical.
pub fn make_patch(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    diff.unified_diff().context_radius(CONTEXT_RADIUS).to_string()
}

/// Parse `@@ -a,b +c,d @@` hunks out of a patch. Lenient about anything
/// before the first header; strict inside hunks.
pub fn parse_hunks(patch: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut lines = patch.split('\n').peekable();

    while let Some(line) = lines.next() {
        let Some(header) = parse_hunk_header(line) else {
            continue;
        };
        let (old_start, old_len, new_start, new_len) = header;
        let mut body = Vec::new();
        let mut old_seen = 0usize;
        let mut new_seen = 0usize;

        while old_seen < old_len || new_seen < new_len {
            let Some(raw) = lines.next() else {
                return Err(SyncError::MalformedPatch(format!(
                    "hunk at -{old_start},{old_len} truncated"
                )));
            };
            if raw.starts_with('\\') {
                // "\ No newline at end of file": previous line has no
                // terminator.
                strip_trailing_newline(&mut body);
                continue;
            }
            let marker = raw.chars().next();
            let text = |r: &str| {
                let mut owned = r.get(1..).unwrap_or("").to_string();
                owned.push('\n');
                owned
            };
            match marker {
                Some(' ') | None => {
                    old_seen += 1;
                    new_seen += 1;
                    body.push(PatchLine::Context(text(raw)));
                }
                Some('+') => {
                    new_seen += 1;
                    body.push(PatchLine::Add(text(raw)));
                }
                Some('-') => {
                    old_seen += 1;
                    body.push(PatchLine::Remove(text(raw)));
                }
                Some(other) => {
                    return Err(SyncError::MalformedPatch(format!(
                        "unexpected line marker {other:?}"
                    )));
                }
            }
        }
        // A trailing no-newline marker can follow the last body line.
        if lines.peek().map(|l| l.starts_with('\\')).unwrap_or(false) {
            lines.next();
            strip_trailing_newline(&mut body);
        }

        hunks.push(Hunk {
            old_start,
            old_len,
            new_start,
            new_len,
            lines: body,
        });
    }
    Ok(hunks)
}

fn strip_trailing_newline(body: &mut [PatchLine]) {
    if let Some(last) = body.last_mut() {
        let s = match last {
            PatchLine::Context(s) | PatchLine::Add(s) | PatchLine::Remove(s) => s,
        };
        if s.ends_with('\n') {
            s.pop();
        }
    }
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let (old_part, rest) = rest.split_once(" +")?;
    let (new_part, _) = rest.split_once(" @@")?;
    let (old_start, old_len) = parse_range(old_part)?;
    let (new_start, new_len) = parse_range(new_part)?;
    Some((old_start, old_len, new_start, new_len))
}

/// `a,b` or bare `a` (length defaults to 1).
fn parse_range(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

/// Apply a patch to `doc`, hunk by hunk. Hunks whose old side cannot be
/// found (at the expected position, then anywhere nearby) are skipped and
/// reported false; the rest still apply.
pub fn apply_patch(patch: &str, doc: &str) -> ApplyOutcome {
    let hunks = match parse_hunks(patch) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!("Refusing to apply malformed patch: {}", e);
            return ApplyOutcome {
                result: doc.to_string(),
                ok: false,
                hunks_ok: Vec::new(),
            };
        }
    };

    let mut lines: Vec<String> = doc.split_inclusive('\n').map(str::to_string).collect();
    let mut hunks_ok = Vec::with_capacity(hunks.len());
    // Running difference between current and original line numbering.
    let mut offset = 0isize;

    for hunk in &hunks {
        let expected: Vec<&str> = hunk.old_lines().collect();
        let anchor = if hunk.old_len == 0 {
            hunk.old_start as isize + offset
        } else {
            hunk.old_start as isize - 1 + offset
        };

        let position = find_anchor(&lines, &expected, anchor);
        match position {
            Some(at) => {
                let replacement: Vec<String> =
                    hunk.new_lines().map(str::to_string).collect();
                lines.splice(at..at + expected.len(), replacement);
                offset += hunk.new_len as isize - hunk.old_len as isize;
                hunks_ok.push(true);
            }
            None => {
                tracing::warn!(
                    old_start = hunk.old_start,
                    "Hunk does not match document, skipping"
                );
                hunks_ok.push(false);
            }
        }
    }

    ApplyOutcome {
        result: lines.concat(),
        ok: hunks_ok.iter().all(|b| *b),
        hunks_ok,
    }
}

/// Locate `expected` in `lines`, preferring `anchor` and fanning outward.
fn find_anchor(lines: &[String], expected: &[&str], anchor: isize) -> Option<usize> {
    let fits = |at: usize| -> bool {
        at + expected.len() <= lines.len()
            && expected
                .iter()
                .zip(&lines[at..at + expected.len()])
                .all(|(e, l)| *e == l.as_str())
    };
    if expected.is_empty() {
        // Pure insertion: clamp into bounds, nothing to verify.
        let at = anchor.clamp(0, lines.len() as isize) as usize;
        return Some(at);
    }
    let start = anchor.clamp(0, lines.len() as isize) as usize;
    if fits(start) {
        return Some(start);
    }
    for delta in 1..=lines.len() {
        if start >= delta && fits(start - delta) {
            return Some(start - delta);
        }
        if fits(start + delta) {
            return Some(start + delta);
        }
    }
    None
}

/// Compute the exact inverse of a patch: hunk ranges swapped, additions and
/// removals flipped. Applying the inverse to a cleanly-patched document
/// restores the original.
pub fn invert_patch(patch: &str) -> Result<String> {
    let hunks = parse_hunks(patch)?;
    let mut out = String::new();
    for hunk in hunks {
        render_range(&mut out, '-', hunk.new_start, hunk.new_len, true);
        render_range(&mut out, '+', hunk.old_start, hunk.old_len, false);
        for line in hunk.lines {
            let (marker, text) = match line {
                PatchLine::Context(s) => (' ', s),
                PatchLine::Add(s) => ('-', s),
                PatchLine::Remove(s) => ('+', s),
            };
            out.push(marker);
            if text.ends_with('\n') {
                out.push_str(&text);
            } else {
                out.push_str(&text);
                out.push_str("\n\\ No newline at end of file\n");
            }
        }
    }
    Ok(out)
}

fn render_range(out: &mut String, sign: char, start: usize, len: usize, opening: bool) {
    if opening {
        out.push_str("@@ ");
    }
    out.push(sign);
    if len == 1 {
        out.push_str(&start.to_string());
    } else {
        out.push_str(&format!("{start},{len}"));
    }
    if opening {
        out.push(' ');
    } else {
        out.push_str(" @@\n");
    }
}
