// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The transform function at the heart of the sync protocol.
//!
//! [`transform`] rebases one operation past another: given `a` and `b`
//! authored against the same document state, `transform(a, b)` is what `a`
//! looks like once `b` has been applied first.
//!
//! ```text
//!          a
//!       * ----> *
//!       |       |
//!     b |       | b' = transform(b, a)
//!       v  a'   v
//!       * ----> *
//!           a' = transform(a, b)
//! ```
//!
//! Both paths around the square end in the same document. That convergence
//! property holds for every variant pair below, and it is what the whole
//! protocol leans on: server and replicas run the *same* function, so they
//! agree on the result no matter which of two concurrent edits they saw
//! first. Co-located inserts are ordered by client id (the smaller id goes
//! first) — that comparison is the sole source of determinism for ties.

use crate::shift_index::ShiftIndex;
use crate::types::Operation;

/// Rebase `a` as if `b` had been applied first.
#[must_use]
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    let mut t = a.clone();
    match (&mut t, b) {
        (
            Operation::Insert {
                pos: a_pos,
                client_id: a_id,
                ..
            },
            Operation::Insert {
                pos: b_pos,
                text: b_text,
                client_id: b_id,
                ..
            },
        ) => {
            let b_len = b_text.chars().count() as u32;
            // On a tie, the insert of the lexicographically smaller client id
            // ends up first in the document.
            if *b_pos < *a_pos || (*b_pos == *a_pos && b_id < &*a_id) {
                *a_pos += b_len;
            }
        }
        (
            Operation::Insert {
                pos: a_pos,
                text: a_text,
                ..
            },
            Operation::Delete {
                pos: b_pos,
                len: b_len,
                ..
            },
        ) => {
            let b_end = b_pos + b_len;
            if *a_pos >= b_end {
                *a_pos -= b_len;
            } else if *a_pos > *b_pos {
                // Insert strictly inside a concurrently deleted range. The
                // mirrored delete absorbs the inserted text, so this side has
                // to give it up too; anything else leaves the two replicas
                // with different documents. Inserts at either boundary of the
                // deletion are untouched by this and survive.
                *a_pos = *b_pos;
                a_text.clear();
            }
        }
        (
            Operation::Delete {
                pos: a_pos,
                len: a_len,
                ..
            },
            Operation::Insert {
                pos: b_pos,
                text: b_text,
                ..
            },
        ) => {
            let b_len = b_text.chars().count() as u32;
            let a_end = *a_pos + *a_len;
            if *b_pos <= *a_pos {
                *a_pos += b_len;
            } else if *b_pos < a_end {
                // Text inserted inside the deleted range is absorbed by the
                // delete.
                *a_len += b_len;
            }
        }
        (
            Operation::Delete {
                pos: a_pos,
                len: a_len,
                ..
            },
            Operation::Delete {
                pos: b_pos,
                len: b_len,
                ..
            },
        ) => {
            let a_end = *a_pos + *a_len;
            let b_end = *b_pos + *b_len;
            if b_end <= *a_pos {
                *a_pos -= b_len;
            } else if *b_pos >= a_end {
                // Entirely to our right: nothing to do.
            } else if *b_pos <= *a_pos && b_end >= a_end {
                // b swallowed all of a.
                *a_pos = *b_pos;
                *a_len = 0;
            } else if *a_pos <= *b_pos && a_end >= b_end {
                // a contains b.
                *a_len -= b_len;
            } else if *b_pos < *a_pos {
                // b overlaps a from the left.
                *a_pos = *b_pos;
                *a_len = a_end - b_end;
            } else {
                // b overlaps a from the right.
                *a_len = *b_pos - *a_pos;
            }
        }
    }
    t
}

/// Rebase `op` past a whole batch, left to right. The order must match the
/// order in which the batch was applied — on the server that is log order.
#[must_use]
pub fn transform_against(op: &Operation, batch: &[Operation]) -> Operation {
    batch.iter().fold(op.clone(), |acc, b| transform(&acc, b))
}

/// Transform `inbound` through a queue of concurrent operations, rewriting
/// the queue onto the new base as we go.
///
/// ```text
///        inbound
///     * --------> *
///     |           |
///  q1 |           | q1'
///     v           v
///     * --------> *
///     |           |
///  q2 |           | q2'
///     v  inbound' v
///     * --------> *
/// ```
///
/// Returns `inbound'` (ready to apply after the whole queue) and `q1'..qn'`
/// (the queue as it reads once `inbound` is part of the base). The server
/// runs this over each client's unseen-operations queue; replicas run it
/// over their outbox. Both directions of every step use the original pair,
/// which is what makes the two sides of each square commute.
#[must_use]
pub fn transform_through(inbound: &Operation, queue: &[Operation]) -> (Operation, Vec<Operation>) {
    let mut inbound = inbound.clone();
    let mut rewritten = Vec::with_capacity(queue.len());
    for q in queue {
        rewritten.push(transform(q, &inbound));
        inbound = transform(&inbound, q);
    }
    (inbound, rewritten)
}

/// Rebase `op` past `batch` with a single Fenwick prefix query instead of a
/// pairwise fold.
///
/// This only matches [`transform_against`] while every batch operation lies
/// strictly to one side of `op`'s span — as soon as one straddles, collapses,
/// or ties with it, position arithmetic alone cannot express the rebase and
/// `None` is returned. The pairwise fold is authoritative; this is the cheap
/// path for long independent tails.
#[must_use]
pub fn rebase_batched(op: &Operation, batch: &[Operation]) -> Option<Operation> {
    let size = batch
        .iter()
        .map(Operation::end)
        .chain([op.end()])
        .max()
        .unwrap_or(0)
        + 1;
    let mut index = ShiftIndex::new(size);
    for b in batch {
        if straddles(op, b) {
            return None;
        }
        match b {
            Operation::Insert { pos, text, .. } => {
                index.add_insert(*pos, text.chars().count() as u32);
            }
            Operation::Delete { pos, len, .. } => index.add_delete(*pos, *len),
        }
    }

    let shift = index.query(i64::from(op.pos()) - 1);
    let pos = (i64::from(op.pos()) + shift).max(0) as u32;
    let mut t = op.clone();
    match &mut t {
        Operation::Insert { pos: p, .. } | Operation::Delete { pos: p, .. } => *p = pos,
    }
    Some(t)
}

/// Whether `b` interferes with `op`'s span in a way a pure position shift
/// cannot capture.
fn straddles(op: &Operation, b: &Operation) -> bool {
    let pos = op.pos();
    let end = op.end();
    match b {
        Operation::Insert { pos: b_pos, .. } => {
            *b_pos == pos || (*b_pos > pos && *b_pos < end)
        }
        Operation::Delete {
            pos: b_pos,
            len: b_len,
            ..
        } => *b_len > 0 && *b_pos < end && b_pos + b_len > pos,
    }
}
