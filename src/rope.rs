// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A balanced rope over Unicode code points.
//!
//! The document text of every session lives in one of these. Structure is the
//! standard split/concat rope: leaves hold bounded string chunks, branches
//! cache the length and height of their subtree, and every mutation is a
//! split at the edit position followed by a height-balanced join. All
//! positions are code-point offsets, never bytes.

use std::fmt;
use thiserror::Error;

/// Upper bound on code points per leaf chunk, to bound copy cost on edits.
const MAX_LEAF: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RopeError {
    #[error("position {index} is out of bounds for a document of length {len}")]
    OutOfBounds { index: u32, len: u32 },
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        text: String,
        /// Code-point count of `text`, cached so length queries never rescan.
        len: usize,
    },
    Branch {
        left: Box<Node>,
        right: Box<Node>,
        len: usize,
        height: usize,
    },
}

impl Node {
    fn leaf(text: String) -> Box<Self> {
        let len = text.chars().count();
        Box::new(Self::Leaf { text, len })
    }

    fn branch(left: Box<Self>, right: Box<Self>) -> Box<Self> {
        let len = left.len() + right.len();
        let height = left.height().max(right.height()) + 1;
        Box::new(Self::Branch {
            left,
            right,
            len,
            height,
        })
    }

    fn len(&self) -> usize {
        match self {
            Self::Leaf { len, .. } | Self::Branch { len, .. } => *len,
        }
    }

    fn height(&self) -> usize {
        match self {
            Self::Leaf { .. } => 1,
            Self::Branch { height, .. } => *height,
        }
    }

    fn into_children(self) -> (Box<Self>, Box<Self>) {
        match self {
            Self::Branch { left, right, .. } => (left, right),
            Self::Leaf { .. } => panic!("A leaf has no children to descend into"),
        }
    }
}

/// Byte offset of the `pos`-th code point, clamped to the end of the string.
fn char_to_byte(text: &str, pos: usize) -> usize {
    text.char_indices().nth(pos).map_or(text.len(), |(i, _)| i)
}

/// Join two subtrees whose heights may differ arbitrarily, descending the
/// taller tree's spine until the height difference is small enough for
/// [`rebalance`]. Adjacent small leaves are merged back into one chunk.
fn join(left: Box<Node>, right: Box<Node>) -> Box<Node> {
    if left.height() == 1 && right.height() == 1 && left.len() + right.len() <= MAX_LEAF {
        match (*left, *right) {
            (Node::Leaf { mut text, len }, Node::Leaf { text: rt, len: rl }) => {
                text.push_str(&rt);
                return Box::new(Node::Leaf {
                    text,
                    len: len + rl,
                });
            }
            _ => panic!("Nodes of height 1 must be leaves"),
        }
    }

    let (hl, hr) = (left.height(), right.height());
    if hl > hr + 1 {
        let (ll, lr) = left.into_children();
        rebalance(ll, join(lr, right))
    } else if hr > hl + 1 {
        let (rl, rr) = right.into_children();
        rebalance(join(left, rl), rr)
    } else {
        Node::branch(left, right)
    }
}

/// Build a branch from two subtrees whose heights differ by at most two,
/// rotating once (single or double) when the difference is exactly two.
fn rebalance(left: Box<Node>, right: Box<Node>) -> Box<Node> {
    let (hl, hr) = (left.height(), right.height());
    if hl >= hr + 2 {
        let (ll, lr) = left.into_children();
        if ll.height() >= lr.height() {
            Node::branch(ll, Node::branch(lr, right))
        } else {
            let (lrl, lrr) = lr.into_children();
            Node::branch(Node::branch(ll, lrl), Node::branch(lrr, right))
        }
    } else if hr >= hl + 2 {
        let (rl, rr) = right.into_children();
        if rr.height() >= rl.height() {
            Node::branch(Node::branch(left, rl), rr)
        } else {
            let (rll, rlr) = rl.into_children();
            Node::branch(Node::branch(left, rll), Node::branch(rlr, rr))
        }
    } else {
        Node::branch(left, right)
    }
}

fn concat(left: Option<Box<Node>>, right: Option<Box<Node>>) -> Option<Box<Node>> {
    match (left, right) {
        (None, node) | (node, None) => node,
        (Some(left), Some(right)) => Some(join(left, right)),
    }
}

/// Split into the first `pos` code points and the rest. Both halves are owned;
/// the input is consumed.
fn split(node: Box<Node>, pos: usize) -> (Option<Box<Node>>, Option<Box<Node>>) {
    match *node {
        Node::Leaf { text, len } => {
            if pos == 0 {
                (None, Some(Box::new(Node::Leaf { text, len })))
            } else if pos >= len {
                (Some(Box::new(Node::Leaf { text, len })), None)
            } else {
                let mut left_text = text;
                let right_text = left_text.split_off(char_to_byte(&left_text, pos));
                (
                    Some(Node::leaf(left_text)),
                    Some(Node::leaf(right_text)),
                )
            }
        }
        Node::Branch { left, right, .. } => {
            let left_len = left.len();
            if pos < left_len {
                let (a, b) = split(left, pos);
                (a, concat(b, Some(right)))
            } else {
                let (a, b) = split(right, pos - left_len);
                (concat(Some(left), a), b)
            }
        }
    }
}

fn split_opt(node: Option<Box<Node>>, pos: usize) -> (Option<Box<Node>>, Option<Box<Node>>) {
    match node {
        None => (None, None),
        Some(node) => split(node, pos),
    }
}

/// Build a subtree from a string, chunked into leaves of at most [`MAX_LEAF`]
/// code points. Returns `None` for the empty string.
fn build(text: &str) -> Option<Box<Node>> {
    let mut root = None;
    let mut rest = text;
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(char_to_byte(rest, MAX_LEAF));
        root = concat(root, Some(Node::leaf(chunk.to_string())));
        rest = tail;
    }
    root
}

fn collect_range(node: &Node, start: usize, end: usize, out: &mut String) {
    if start >= end {
        return;
    }
    match node {
        Node::Leaf { text, .. } => {
            let from = char_to_byte(text, start);
            let to = char_to_byte(text, end);
            out.push_str(&text[from..to]);
        }
        Node::Branch { left, right, .. } => {
            let left_len = left.len();
            if start < left_len {
                collect_range(left, start, end.min(left_len), out);
            }
            if end > left_len {
                collect_range(right, start.saturating_sub(left_len), end - left_len, out);
            }
        }
    }
}

/// An ordered sequence of code points with O(log n) edits.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct Rope {
    root: Option<Box<Node>>,
}

impl Rope {
    pub fn new(text: &str) -> Self {
        Self { root: build(text) }
    }

    /// Total code-point count.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.root.as_ref().map_or(0, |node| node.len()) as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn char_at(&self, index: u32) -> Result<char, RopeError> {
        let len = self.len();
        if index >= len {
            return Err(RopeError::OutOfBounds { index, len });
        }
        let mut node = self
            .root
            .as_deref()
            .expect("A non-zero length rope has a root");
        let mut i = index as usize;
        loop {
            match node {
                Node::Leaf { text, .. } => {
                    return Ok(text
                        .chars()
                        .nth(i)
                        .expect("Index was checked against the length"));
                }
                Node::Branch { left, right, .. } => {
                    if i < left.len() {
                        node = left;
                    } else {
                        i -= left.len();
                        node = right;
                    }
                }
            }
        }
    }

    /// The text in `[start, end)`.
    pub fn substring(&self, start: u32, end: u32) -> Result<String, RopeError> {
        let len = self.len();
        if start > end || end > len {
            return Err(RopeError::OutOfBounds {
                index: start.max(end),
                len,
            });
        }
        let mut out = String::new();
        if let Some(root) = &self.root {
            collect_range(root, start as usize, end as usize, &mut out);
        }
        Ok(out)
    }

    pub fn insert(&mut self, pos: u32, text: &str) -> Result<(), RopeError> {
        let len = self.len();
        if pos > len {
            return Err(RopeError::OutOfBounds { index: pos, len });
        }
        if text.is_empty() {
            return Ok(());
        }
        let (left, right) = split_opt(self.root.take(), pos as usize);
        self.root = concat(concat(left, build(text)), right);
        Ok(())
    }

    pub fn delete(&mut self, pos: u32, len: u32) -> Result<(), RopeError> {
        let doc_len = self.len();
        if pos.checked_add(len).map_or(true, |end| end > doc_len) {
            return Err(RopeError::OutOfBounds {
                index: pos.saturating_add(len),
                len: doc_len,
            });
        }
        if len == 0 {
            return Ok(());
        }
        let (left, rest) = split_opt(self.root.take(), pos as usize);
        let (_, right) = split_opt(rest, len as usize);
        self.root = concat(left, right);
        Ok(())
    }
}

impl fmt::Display for Rope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn write_node(node: &Node, f: &mut fmt::Formatter) -> fmt::Result {
            match node {
                Node::Leaf { text, .. } => f.write_str(text),
                Node::Branch { left, right, .. } => {
                    write_node(left, f)?;
                    write_node(right, f)
                }
            }
        }
        match &self.root {
            None => Ok(()),
            Some(root) => write_node(root, f),
        }
    }
}

impl From<&str> for Rope {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
