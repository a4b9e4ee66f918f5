//! Tree expansion.
//!
//! [`Parser`] reads a template through a [`Reader`], parses it, and
//! resolves its `extends`, `import` and `include` directives by parsing
//! the referenced files recursively. Parsed trees are cached, so only one
//! read per `(path, context)` pair happens even when several threads parse
//! overlapping template graphs at the same time.
//!
//! Returned trees are shared through the cache and must not be mutated;
//! clone a tree before transforming it.

use std::sync::Arc;

use tracing::debug;
use vela_core::{Context, Position, VelaError, VelaResult};

use crate::ast::{Node, NodeId, Tree};
use crate::cache::TreeCache;
use crate::parser::{parse_source, ParseOptions};
use crate::path::{to_absolute_path, valid_path};
use crate::reader::Reader;

/// A parser that reads trees from a reader and expands their inclusion
/// directives. Safe for concurrent use.
pub struct Parser<R: Reader> {
    reader: R,
    trees: TreeCache,
    options: ParseOptions,
}

impl<R: Reader> Parser<R> {
    /// Create a parser reading sources from `reader`.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self::with_options(reader, ParseOptions::default())
    }

    /// Create a parser with explicit options.
    #[must_use]
    pub fn with_options(reader: R, options: ParseOptions) -> Self {
        Self {
            reader,
            trees: TreeCache::new(),
            options,
        }
    }

    /// Read, parse and expand the template at `path` in context `ctx`.
    ///
    /// The path is anchored to the template root; the expanded tree has a
    /// non-empty `tree` slot on every `extends`, `import` and `include`
    /// node.
    pub fn parse(&self, path: &str, ctx: Context) -> VelaResult<Arc<Tree>> {
        if path.is_empty() || !valid_path(path) {
            return Err(VelaError::InvalidPath);
        }
        let path = to_absolute_path("/", path.trim_start_matches('/'))?;

        let mut expansion = Expansion {
            reader: &self.reader,
            trees: &self.trees,
            paths: Vec::new(),
            options: &self.options,
        };
        match expansion.parse_path(&path, ctx) {
            Err(VelaError::Syntax {
                path: p,
                pos,
                message,
            }) if p.is_empty() => Err(VelaError::Syntax {
                path,
                pos,
                message,
            }),
            other => other,
        }
    }
}

/// Calls [`TreeCache::done`] on every exit path of a parse attempt.
struct DoneGuard<'a> {
    trees: &'a TreeCache,
    path: &'a str,
    ctx: Context,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.trees.done(self.path, self.ctx);
    }
}

/// The state of one expansion: the reader, the shared cache and the stack
/// of paths currently being expanded, used to detect cycles.
struct Expansion<'a, R: Reader> {
    reader: &'a R,
    trees: &'a TreeCache,
    paths: Vec<String>,
    options: &'a ParseOptions,
}

impl<R: Reader> Expansion<'_, R> {
    /// Resolve `path` against the file currently being expanded.
    fn abs(&self, path: &str) -> VelaResult<String> {
        if let Some(rest) = path.strip_prefix('/') {
            to_absolute_path("/", rest)
        } else {
            let parent = self.paths.last().expect("path stack is empty");
            let sep = parent.rfind('/').expect("absolute path has a separator");
            to_absolute_path(&parent[..=sep], path)
        }
    }

    /// Parse the source at the absolute, cleaned `path` in context `ctx`
    /// and expand it.
    fn parse_path(&mut self, path: &str, ctx: Context) -> VelaResult<Arc<Tree>> {
        if self.paths.iter().any(|p| p == path) {
            return Err(VelaError::cycle(path));
        }
        if let Some(tree) = self.trees.get(path, ctx) {
            return Ok(tree);
        }
        let _done = DoneGuard {
            trees: self.trees,
            path,
            ctx,
        };

        let src = self.reader.read(path, ctx)?;
        let mut tree = match parse_source(&src, ctx, self.options) {
            Err(VelaError::Syntax {
                path: p,
                pos,
                message,
            }) if p.is_empty() => {
                return Err(VelaError::Syntax {
                    path: path.to_string(),
                    pos,
                    message,
                });
            }
            other => other?,
        };
        tree.path = path.to_string();
        if let Some(transformer) = &self.options.tree_transformer {
            transformer(&mut tree)?;
        }

        debug!(path, "expanding tree");
        self.paths.push(path.to_string());
        let roots = tree.nodes.clone();
        let result = self.expand_nodes(&roots, &mut tree, ctx);
        self.paths.pop();
        if let Err(err) = result {
            return Err(match err {
                VelaError::Cycle(inner) => VelaError::Cycle(format!("{path}\n\t{inner}")),
                VelaError::Syntax {
                    path: p,
                    pos,
                    message,
                } if p.is_empty() => VelaError::Syntax {
                    path: path.to_string(),
                    pos,
                    message,
                },
                other => other,
            });
        }

        let tree = Arc::new(tree);
        self.trees.add(path, ctx, Arc::clone(&tree));
        Ok(tree)
    }

    fn expand_nodes(&mut self, ids: &[NodeId], tree: &mut Tree, ctx: Context) -> VelaResult<()> {
        for &id in ids {
            self.expand_node(id, tree, ctx)?;
        }
        Ok(())
    }

    fn expand_node(&mut self, id: NodeId, tree: &mut Tree, ctx: Context) -> VelaResult<()> {
        match tree.get(id) {
            Node::If { then, els, .. } => {
                let (then, els) = (*then, *els);
                self.expand_node(then, tree, ctx)?;
                if let Some(els) = els {
                    self.expand_node(els, tree, ctx)?;
                }
            }
            Node::Block { nodes, .. } => {
                let nodes = nodes.clone();
                self.expand_nodes(&nodes, tree, ctx)?;
            }
            Node::For { body, .. } | Node::ForRange { body, .. } | Node::Macro { body, .. } => {
                let body = body.clone();
                self.expand_nodes(&body, tree, ctx)?;
            }
            Node::Switch { cases, .. } | Node::TypeSwitch { cases, .. } => {
                let cases = cases.clone();
                for case in cases {
                    if let Node::Case { body, .. } = tree.get(case) {
                        let body = body.clone();
                        self.expand_nodes(&body, tree, ctx)?;
                    }
                }
            }
            Node::Label { statement, .. } => {
                if let Some(statement) = *statement {
                    self.expand_node(statement, tree, ctx)?;
                }
            }
            Node::Extends { path, context, pos, .. } => {
                if self.paths.len() > 1 {
                    return Err(VelaError::syntax(
                        *pos,
                        "extended, imported and included paths can not have extends",
                    ));
                }
                let (path, node_ctx, pos) = (path.clone(), *context, *pos);
                let subtree =
                    self.parse_sub(&path, node_ctx, pos, "extends path", "imports")?;
                match tree.get_mut(id) {
                    Node::Extends { tree: slot, .. } => *slot = Some(subtree),
                    _ => unreachable!("node kind changed during expansion"),
                }
            }
            Node::Import { path, context, pos, .. } => {
                let (path, node_ctx, pos) = (path.clone(), *context, *pos);
                let subtree =
                    self.parse_sub(&path, node_ctx, pos, "import path", "imports")?;
                match tree.get_mut(id) {
                    Node::Import { tree: slot, .. } => *slot = Some(subtree),
                    _ => unreachable!("node kind changed during expansion"),
                }
            }
            Node::Include { path, context, pos, .. } => {
                let (path, node_ctx, pos) = (path.clone(), *context, *pos);
                let subtree =
                    self.parse_sub(&path, node_ctx, pos, "included path", "include")?;
                match tree.get_mut(id) {
                    Node::Include { tree: slot, .. } => *slot = Some(subtree),
                    _ => unreachable!("node kind changed during expansion"),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Resolve and parse the target of a directive, mapping resolution
    /// failures to diagnostics at the directive's position.
    fn parse_sub(
        &mut self,
        path: &str,
        ctx: Context,
        pos: Position,
        what: &str,
        cycle_prefix: &str,
    ) -> VelaResult<Arc<Tree>> {
        let abs = match self.abs(path) {
            Ok(abs) => abs,
            Err(VelaError::InvalidPath) => {
                return Err(VelaError::syntax(pos, format!("invalid path {path:?}")));
            }
            Err(err) => return Err(err),
        };
        match self.parse_path(&abs, ctx) {
            Ok(tree) => Ok(tree),
            Err(VelaError::InvalidPath) => {
                Err(VelaError::syntax(pos, format!("invalid path {path:?}")))
            }
            Err(VelaError::NotExist) => Err(VelaError::syntax(
                pos,
                format!("{what} {abs:?} does not exist"),
            )),
            Err(VelaError::Cycle(inner)) => {
                Err(VelaError::Cycle(format!("{cycle_prefix} {inner}")))
            }
            Err(err) => Err(err),
        }
    }
}
