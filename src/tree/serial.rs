//! Textual serialization and deserialization of trees.
//!
//! The wire format is a pre-order DFS, one node per line:
//!
//! ```text
//! children leaves_below v0 v1 ... v{d-1}
//! ```
//!
//! followed by each child's subtree in order. A leaf has `children = 0`.
//! Floats are written fixed with six decimal places; parsing and re-printing
//! through the same formatter is idempotent, which is what makes round trips
//! byte-identical. The deserializer infers the dimensionality from the first
//! line's field count (`fields - 2`).
//!
//! Serialization is a quiescent-tree operation: normalize first, and do not
//! run it while writers are active.

use std::error::Error as StdError;
use std::fmt as StdFmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::str::SplitWhitespace;
use std::sync::atomic::AtomicPtr;

use crate::arena::Arena;
use crate::node::Node;
use crate::split_count::AtomicSplitCount;
use crate::vector::Vector;

use super::KTree;

// ============================================================================
//  ParseError
// ============================================================================

/// Errors produced while reading a serialized tree or a vector file.
#[derive(Debug)]
pub enum ParseError {
    /// The underlying reader failed.
    Io(io::Error),

    /// A token was not a number of the expected kind.
    MalformedToken {
        token: String,
    },

    /// The stream ended in the middle of a tree or a record.
    TruncatedStream,

    /// A line carried the wrong number of fields.
    FieldCount {
        expected: usize,
        found: usize,
    },

    /// A serialized node claims more children than the branching factor
    /// allows.
    BranchingFactor {
        children: usize,
        max_children: usize,
    },
}

impl StdFmt::Display for ParseError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Io(error) => write!(f, "read failed: {error}"),

            Self::MalformedToken { token } => write!(f, "malformed token {token:?}"),

            Self::TruncatedStream => write!(f, "stream ended mid-record"),

            Self::FieldCount { expected, found } => {
                write!(f, "expected {expected} fields per line, found {found}")
            }

            Self::BranchingFactor {
                children,
                max_children,
            } => write!(
                f,
                "node with {children} children exceeds branching factor {max_children}"
            ),
        }
    }
}

impl StdError for ParseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

// ============================================================================
//  Serialization
// ============================================================================

impl<'arena> KTree<'arena> {
    /// Write the tree to `writer` in the textual pre-order format.
    ///
    /// An empty tree writes nothing.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the writer.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        if let Some(root) = self.root() {
            render_subtree(root, writer)?;
        }

        Ok(())
    }

    /// Serialize into an owned `String`.
    #[must_use]
    pub fn serialize_to_string(&self) -> String {
        let mut buffer = Vec::new();
        self.serialize(&mut buffer)
            .expect("writing to a Vec cannot fail");

        String::from_utf8(buffer).expect("serialized trees are ASCII")
    }

    /// Write only the bottom-level cluster nodes (the level above the
    /// leaves), in the same line format.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the writer.
    pub fn render_clusters<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        if let Some(root) = self.root() {
            render_penultimate(root, writer)?;
        }

        Ok(())
    }

    /// Rebuild a tree from a reader holding the textual format.
    ///
    /// The dimensionality is inferred from the first line; the branching
    /// factor is not part of the stream and must be supplied.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] on I/O failure, malformed tokens, truncated
    /// input, or a node that exceeds `branching_factor`.
    pub fn deserialize<R: Read>(
        arena: &'arena Arena,
        reader: &mut R,
        branching_factor: usize,
    ) -> Result<Self, ParseError> {
        let mut text = String::new();
        reader.read_to_string(&mut text).map_err(ParseError::Io)?;

        Self::deserialize_str(arena, &text, branching_factor)
    }

    /// Rebuild a tree from a string holding the textual format.
    ///
    /// # Errors
    ///
    /// As [`KTree::deserialize`], minus the I/O failures.
    pub fn deserialize_str(
        arena: &'arena Arena,
        text: &str,
        branching_factor: usize,
    ) -> Result<Self, ParseError> {
        let first_line = text
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or(ParseError::TruncatedStream)?;

        let fields = first_line.split_whitespace().count();
        if fields < 3 {
            return Err(ParseError::FieldCount {
                expected: 3,
                found: fields,
            });
        }
        let dims = fields - 2;

        let mut tokens = text.split_whitespace();
        let root = parse_subtree(&mut tokens, arena, dims, branching_factor)?;

        Ok(Self {
            root: AtomicPtr::new(root),
            split_count: AtomicSplitCount::new(),
            parameters: Node::new_prototype(arena, branching_factor, dims),
            _arena: PhantomData,
        })
    }
}

/// Write one node's line: clamped child count, leaf count, centroid lanes.
fn render_line<W: Write>(node: &Node, writer: &mut W) -> io::Result<()> {
    write!(writer, "{} {}", node.number_of_children(), node.leaves_below())?;

    let centroid = node.centroid();
    for lane in 0..centroid.dims() {
        write!(writer, " {:.6}", centroid.get(lane))?;
    }

    writeln!(writer)
}

fn render_subtree<W: Write>(node: &Node, writer: &mut W) -> io::Result<()> {
    render_line(node, writer)?;

    for which in 0..node.number_of_children() {
        if let Some(child) = node.child(which) {
            render_subtree(child, writer)?;
        }
    }

    Ok(())
}

fn render_penultimate<W: Write>(node: &Node, writer: &mut W) -> io::Result<()> {
    let children = node.number_of_children();
    if children == 0 {
        return Ok(());
    }

    if node.child(0).is_some_and(Node::is_leaf) {
        render_line(node, writer)?;
    }

    for which in 0..children {
        if let Some(child) = node.child(which) {
            render_penultimate(child, writer)?;
        }
    }

    Ok(())
}

// ============================================================================
//  Parsing
// ============================================================================

fn next_token<'t>(tokens: &mut SplitWhitespace<'t>) -> Result<&'t str, ParseError> {
    tokens.next().ok_or(ParseError::TruncatedStream)
}

fn next_usize(tokens: &mut SplitWhitespace<'_>) -> Result<usize, ParseError> {
    let token = next_token(tokens)?;
    token.parse().map_err(|_| ParseError::MalformedToken {
        token: token.to_string(),
    })
}

fn next_f32(tokens: &mut SplitWhitespace<'_>) -> Result<f32, ParseError> {
    let token = next_token(tokens)?;
    token.parse().map_err(|_| ParseError::MalformedToken {
        token: token.to_string(),
    })
}

/// Parse one node and, recursively, its children.
fn parse_subtree(
    tokens: &mut SplitWhitespace<'_>,
    arena: &Arena,
    dims: usize,
    branching_factor: usize,
) -> Result<*mut Node, ParseError> {
    let children = next_usize(tokens)?;
    let leaves = next_usize(tokens)?;

    if children > branching_factor {
        return Err(ParseError::BranchingFactor {
            children,
            max_children: branching_factor,
        });
    }

    let vector = Vector::new(dims);
    for lane in 0..dims {
        vector.set(lane, next_f32(tokens)?);
    }

    if children == 0 {
        // A leaf; its leaf count is 1 by construction.
        return Ok(Node::new_leaf(arena, &vector, branching_factor));
    }

    let node = Node::new_internal(arena, dims, branching_factor, None);
    // SAFETY: the node is unpublished until this function returns.
    let node_ref = unsafe { &*node };
    node_ref.centroid().assign(&vector);

    for _ in 0..children {
        let child = parse_subtree(tokens, arena, dims, branching_factor)?;
        node_ref.adopt_child(child);
    }
    node_ref.set_leaves_below(leaves);

    Ok(node)
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree<'arena>(arena: &'arena Arena) -> KTree<'arena> {
        let tree = KTree::new(arena, 3, 2);
        for point in [
            [0.0, 0.0],
            [0.0, 1.0],
            [1.0, 0.0],
            [5.0, 5.0],
            [5.0, 6.0],
            [6.0, 5.0],
        ] {
            tree.insert(arena, &Vector::from_slice(&point));
        }
        tree.normalize_counts();
        tree
    }

    #[test]
    fn test_leaf_lines_have_zero_children() {
        let arena = Arena::new();
        let tree = small_tree(&arena);

        let text = tree.serialize_to_string();
        let leaf_lines = text
            .lines()
            .filter(|line| line.starts_with("0 "))
            .count();

        assert_eq!(leaf_lines, 6);
    }

    #[test]
    fn test_first_line_field_count_is_dims_plus_two() {
        let arena = Arena::new();
        let tree = small_tree(&arena);

        let text = tree.serialize_to_string();
        let first_line = text.lines().next().unwrap();

        assert_eq!(first_line.split_whitespace().count(), 2 + 2);
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let arena = Arena::new();
        let tree = small_tree(&arena);
        let text = tree.serialize_to_string();

        let reload_arena = Arena::new();
        let reloaded = KTree::deserialize_str(&reload_arena, &text, 3).unwrap();

        assert_eq!(reloaded.dims(), 2);
        assert_eq!(reloaded.branching_factor(), 3);
        assert_eq!(reloaded.serialize_to_string(), text);
    }

    #[test]
    fn test_render_clusters_emits_only_leaf_parents() {
        let arena = Arena::new();
        let tree = small_tree(&arena);

        let mut buffer = Vec::new();
        tree.render_clusters(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        // Two bottom-level clusters of three leaves each.
        let mut leaf_totals = 0;
        for line in text.lines() {
            let leaves: usize = line.split_whitespace().nth(1).unwrap().parse().unwrap();
            leaf_totals += leaves;
        }
        assert_eq!(leaf_totals, 6);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let arena = Arena::new();
        let error = KTree::deserialize_str(&arena, "  \n ", 4).unwrap_err();

        assert!(matches!(error, ParseError::TruncatedStream));
    }

    #[test]
    fn test_malformed_token_is_an_error() {
        let arena = Arena::new();
        let error = KTree::deserialize_str(&arena, "0 1 zz\n", 4).unwrap_err();

        assert!(matches!(error, ParseError::MalformedToken { .. }));
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let arena = Arena::new();
        // Promises two children, provides none.
        let error = KTree::deserialize_str(&arena, "2 2 0.500000\n", 4).unwrap_err();

        assert!(matches!(error, ParseError::TruncatedStream));
    }

    #[test]
    fn test_short_first_line_is_an_error() {
        let arena = Arena::new();
        let error = KTree::deserialize_str(&arena, "2 2\n", 4).unwrap_err();

        assert!(matches!(error, ParseError::FieldCount { .. }));
    }

    #[test]
    fn test_oversized_node_is_an_error() {
        let arena = Arena::new();
        let text = "5 5 0.000000\n0 1 1.000000\n0 1 2.000000\n0 1 3.000000\n0 1 4.000000\n0 1 5.000000\n";
        let error = KTree::deserialize_str(&arena, text, 2).unwrap_err();

        assert!(matches!(error, ParseError::BranchingFactor { .. }));
    }
}
