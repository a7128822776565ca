//! Tree node type and serialization.
//!
//! A node is either a leaf holding a `(key, value)` pair, or an inner node
//! holding a separator key and the hashes of its two children. The separator
//! of an inner node is the largest key in its left subtree: lookups descend
//! left when the probe key is less than or equal to it.
//!
//! The serialization is self-describing and the node's identity is the
//! BLAKE2b-256 of it, so equal content always yields an equal hash.

use riptide_ids::{hash256, Hash256};

use crate::{Result, TreeError};

/// Discriminates leaf nodes from inner nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A leaf holding a key/value pair.
    Leaf,
    /// An inner node holding a separator key and two children.
    Inner,
}

/// A tree node.
///
/// Nodes are immutable once built; mutations create fresh nodes along the
/// path from the root (path copying), which is what makes snapshots cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Content hash of the serialization.
    pub id: Hash256,
    /// Leaf or inner.
    pub kind: NodeKind,
    /// Leaf: entry key. Inner: largest key in the left subtree.
    pub key: Vec<u8>,
    /// Leaf only; empty for inner nodes.
    pub value: Vec<u8>,
    /// Inner only; hash of the left child.
    pub left: Hash256,
    /// Inner only; hash of the right child.
    pub right: Hash256,
    /// Number of leaves in this subtree.
    pub size: u64,
    /// View ID of the round that last modified this subtree's root.
    pub view_id: u64,
    /// Height of this subtree (leaves have height 1).
    pub height: u64,
}

impl Node {
    /// Builds a leaf node stamped with the given view ID.
    #[must_use]
    pub fn leaf(key: Vec<u8>, value: Vec<u8>, view_id: u64) -> Self {
        let mut node = Self {
            id: [0u8; 32],
            kind: NodeKind::Leaf,
            key,
            value,
            left: [0u8; 32],
            right: [0u8; 32],
            size: 1,
            view_id,
            height: 1,
        };
        node.id = hash256(&node.serialize());
        node
    }

    /// Builds an inner node over two children stamped with the given view ID.
    ///
    /// The separator key must be the largest key in the left subtree. Size
    /// and height are derived from the children.
    #[must_use]
    pub fn inner(
        key: Vec<u8>,
        left: &Node,
        right: &Node,
        view_id: u64,
    ) -> Self {
        let mut node = Self {
            id: [0u8; 32],
            kind: NodeKind::Inner,
            key,
            value: Vec::new(),
            left: left.id,
            right: right.id,
            size: left.size + right.size,
            view_id,
            height: 1 + left.height.max(right.height),
        };
        node.id = hash256(&node.serialize());
        node
    }

    /// Serializes the node: kind byte, key length + key, value length +
    /// value (leaf only), left/right child hashes (inner only), subtree
    /// size, view ID, height.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + 4 + self.key.len() + 4 + self.value.len() + 64 + 24,
        );

        buf.push(match self.kind {
            NodeKind::Leaf => 0u8,
            NodeKind::Inner => 1u8,
        });

        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);

        match self.kind {
            NodeKind::Leaf => {
                buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
                buf.extend_from_slice(&self.value);
            }
            NodeKind::Inner => {
                buf.extend_from_slice(&self.left);
                buf.extend_from_slice(&self.right);
            }
        }

        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.view_id.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());

        buf
    }

    /// Deserializes a node from the front of `buf`, returning the node and
    /// the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `TreeError::InvalidDiff` if the bytes are truncated or the
    /// kind byte is unknown.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0usize;

        let kind = match take(buf, &mut pos, 1)?[0] {
            0 => NodeKind::Leaf,
            1 => NodeKind::Inner,
            other => {
                return Err(TreeError::InvalidDiff(format!(
                    "unknown node kind {other}"
                )))
            }
        };

        let key_len = read_u32(buf, &mut pos)? as usize;
        let key = take(buf, &mut pos, key_len)?.to_vec();

        let (value, left, right) = match kind {
            NodeKind::Leaf => {
                let value_len = read_u32(buf, &mut pos)? as usize;
                let value = take(buf, &mut pos, value_len)?.to_vec();
                (value, [0u8; 32], [0u8; 32])
            }
            NodeKind::Inner => {
                let mut left = [0u8; 32];
                left.copy_from_slice(take(buf, &mut pos, 32)?);
                let mut right = [0u8; 32];
                right.copy_from_slice(take(buf, &mut pos, 32)?);
                (Vec::new(), left, right)
            }
        };

        let size = read_u64(buf, &mut pos)?;
        let view_id = read_u64(buf, &mut pos)?;
        let height = read_u64(buf, &mut pos)?;

        let mut node = Self {
            id: [0u8; 32],
            kind,
            key,
            value,
            left,
            right,
            size,
            view_id,
            height,
        };
        node.id = hash256(&buf[..pos]);

        Ok((node, pos))
    }

    /// Returns true if this is a leaf node.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if buf.len() < *pos + len {
        return Err(TreeError::InvalidDiff("truncated node".into()));
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = take(buf, pos, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let bytes = take(buf, pos, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
}
