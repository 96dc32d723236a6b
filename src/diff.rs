//! Line-level comparison of file versions
//!
//! Two contents are compared by hash first; equal hashes are
//! [`DiffKind::Identical`] without looking at the bytes. Content with a NUL
//! byte in its first 8 KiB, or larger than [`DiffOptions::max_file_size`], is
//! [`DiffKind::Binary`] and gets no hunks. Everything else is split into lines
//! and diffed through a longest-common-subsequence table after trimming the
//! common prefix and suffix. When the changed region would need a table
//! larger than [`DiffOptions::max_table_cells`], it is reported as all of its
//! old lines deleted followed by all of its new lines added.
//!
//! Hunks are built by widening every changed line by `context_lines` on both
//! sides and merging ranges that touch, the way unified diffs group changes.
//!
//! ```rust,no_run
//! use verspace::diff::compare;
//! use verspace::types::{DiffKind, DiffOptions};
//!
//! let (kind, hunks) = compare(b"a\nb\nc\n", b"a\nB\nc\n", &DiffOptions::default());
//! assert_eq!(kind, DiffKind::Text);
//! assert_eq!(hunks.len(), 1);
//! ```

use crate::error::{Result, VersionError};
use crate::store::VersionStore;
use crate::types::{DiffHunk, DiffKind, DiffOptions, FileVersion, LineChange, VersionDiff};
use crate::utils::hash_data;
use std::io;
use tracing::{debug, instrument};

const BINARY_PROBE: usize = 8 * 1024;

/// True if `content` has a NUL byte in its first 8 KiB
pub fn is_binary_content(content: &[u8]) -> bool {
    content.iter().take(BINARY_PROBE).any(|&b| b == 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Keep(usize, usize),
    Delete(usize),
    Insert(usize),
}

fn lines_equal(a: &str, b: &str, ignore_whitespace: bool) -> bool {
    if ignore_whitespace {
        a.trim() == b.trim()
    } else {
        a == b
    }
}

fn edit_script(old: &[&str], new: &[&str], ignore_whitespace: bool, max_cells: usize) -> Vec<Op> {
    let eq = |a: &str, b: &str| lines_equal(a, b, ignore_whitespace);

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| eq(a, b))
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| eq(a, b))
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    let (m, n) = (old_mid.len(), new_mid.len());
    let old_tail = old.len() - suffix;
    let new_tail = new.len() - suffix;

    let mut ops: Vec<Op> = (0..prefix).map(|i| Op::Keep(i, i)).collect();
    let cells = (m + 1).checked_mul(n + 1);
    if cells.map_or(true, |c| c > max_cells) {
        debug!("Changed region of {}x{} lines exceeds the table budget", m, n);
        ops.extend((prefix..old_tail).map(Op::Delete));
        ops.extend((prefix..new_tail).map(Op::Insert));
        ops.extend((0..suffix).map(|k| Op::Keep(old_tail + k, new_tail + k)));
        return ops;
    }

    // dp[i][j] = LCS length of old_mid[i..] and new_mid[j..]
    let mut dp = vec![vec![0u32; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            dp[i][j] = if eq(old_mid[i], new_mid[j]) {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < m || j < n {
        if i < m && j < n && eq(old_mid[i], new_mid[j]) {
            ops.push(Op::Keep(prefix + i, prefix + j));
            i += 1;
            j += 1;
        } else if j == n || (i < m && dp[i + 1][j] >= dp[i][j + 1]) {
            ops.push(Op::Delete(prefix + i));
            i += 1;
        } else {
            ops.push(Op::Insert(prefix + j));
            j += 1;
        }
    }
    ops.extend((0..suffix).map(|k| Op::Keep(old_tail + k, new_tail + k)));
    ops
}

fn build_hunks(ops: &[Op], old: &[&str], new: &[&str], context: usize) -> Vec<DiffHunk> {
    // Ranges of op indices to show, widened by context and merged
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (idx, op) in ops.iter().enumerate() {
        if matches!(op, Op::Keep(..)) {
            continue;
        }
        let start = idx.saturating_sub(context);
        let end = (idx + context).min(ops.len() - 1);
        match ranges.last_mut() {
            Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
            _ => ranges.push((start, end)),
        }
    }

    // Old and new line positions before each op
    let mut positions = Vec::with_capacity(ops.len());
    let (mut o, mut n) = (0, 0);
    for op in ops {
        positions.push((o, n));
        match op {
            Op::Keep(..) => {
                o += 1;
                n += 1;
            }
            Op::Delete(_) => o += 1,
            Op::Insert(_) => n += 1,
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            let (from_pos, to_pos) = positions[start];
            let mut hunk = DiffHunk {
                from_line: from_pos + 1,
                from_count: 0,
                to_line: to_pos + 1,
                to_count: 0,
                changes: Vec::with_capacity(end - start + 1),
            };
            for op in &ops[start..=end] {
                match *op {
                    Op::Keep(oi, _) => {
                        hunk.from_count += 1;
                        hunk.to_count += 1;
                        hunk.changes.push(LineChange::Context(oi + 1, old[oi].to_string()));
                    }
                    Op::Delete(oi) => {
                        hunk.from_count += 1;
                        hunk.changes.push(LineChange::Deleted(oi + 1, old[oi].to_string()));
                    }
                    Op::Insert(ni) => {
                        hunk.to_count += 1;
                        hunk.changes.push(LineChange::Added(ni + 1, new[ni].to_string()));
                    }
                }
            }
            hunk
        })
        .collect()
}

/// Classify two contents and compute their hunks
///
/// Hunks are empty unless the returned kind is [`DiffKind::Text`].
pub fn compare(old: &[u8], new: &[u8], options: &DiffOptions) -> (DiffKind, Vec<DiffHunk>) {
    if old == new {
        return (DiffKind::Identical, Vec::new());
    }
    let too_large = old.len() as u64 > options.max_file_size || new.len() as u64 > options.max_file_size;
    if too_large || is_binary_content(old) || is_binary_content(new) {
        return (DiffKind::Binary, Vec::new());
    }

    let old_text = String::from_utf8_lossy(old);
    let new_text = String::from_utf8_lossy(new);
    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();

    let ops = edit_script(
        &old_lines,
        &new_lines,
        options.ignore_whitespace,
        options.max_table_cells,
    );
    let hunks = build_hunks(&ops, &old_lines, &new_lines, options.context_lines);
    (DiffKind::Text, hunks)
}

fn assemble(from: &FileVersion, to: Option<&FileVersion>, new_hash: &str, old: &[u8], new: &[u8], options: &DiffOptions) -> VersionDiff {
    let (kind, hunks) = if from.content_hash == new_hash {
        (DiffKind::Identical, Vec::new())
    } else {
        compare(old, new, options)
    };

    let count = |pred: fn(&LineChange) -> bool| -> usize {
        hunks.iter().flat_map(|h| h.changes.iter()).filter(|c| pred(c)).count()
    };
    let lines_added = count(|c| matches!(c, LineChange::Added(..)));
    let lines_deleted = count(|c| matches!(c, LineChange::Deleted(..)));

    VersionDiff {
        from: from.id,
        to: to.map(|v| v.id),
        file_path: from.file_path.clone(),
        kind,
        hunks,
        lines_added,
        lines_deleted,
    }
}

/// Compare two stored versions of the same file
#[instrument(skip(store, from, to, options), fields(from = %from.short_id(), to = %to.short_id()))]
pub fn diff_versions(
    store: &VersionStore,
    from: &FileVersion,
    to: &FileVersion,
    options: &DiffOptions,
) -> Result<VersionDiff> {
    if from.file_path != to.file_path {
        return Err(VersionError::invalid_version(format!(
            "Versions {} and {} belong to different files",
            from.short_id(),
            to.short_id()
        )));
    }
    if from.content_hash == to.content_hash {
        return Ok(assemble(from, Some(to), &to.content_hash, &[], &[], options));
    }

    let old = store.read(from)?;
    let new = store.read(to)?;
    let diff = assemble(from, Some(to), &to.content_hash, &old, &new, options);
    debug!("+{} -{} lines", diff.lines_added, diff.lines_deleted);
    Ok(diff)
}

/// Compare a stored version with the live file
///
/// A missing live file compares as empty content.
pub fn diff_with_current(store: &VersionStore, version: &FileVersion, options: &DiffOptions) -> Result<VersionDiff> {
    let current = match store.fs().read(&version.file_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let current_hash = hash_data(&current);
    if current_hash == version.content_hash {
        return Ok(assemble(version, None, &current_hash, &[], &[], options));
    }
    let old = store.read(version)?;
    Ok(assemble(version, None, &current_hash, &old, &current, options))
}
