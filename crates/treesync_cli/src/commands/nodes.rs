//! Node commands: add-root, print-nodes, print-info and reset.

use super::session::{Options, Session};
use serde::Serialize;
use std::error::Error;
use treesync_core::{Node, NodeId};

/// A node line of `print-nodes`.
#[derive(Debug, Serialize)]
pub struct NodeLine {
    /// Node id.
    pub id: NodeId,
    /// Text payload.
    pub text: String,
    /// 0 for the root, 1 for its children.
    pub depth: usize,
    /// Number of children.
    pub children: usize,
}

impl NodeLine {
    fn new(node: &Node, depth: usize) -> Self {
        Self {
            id: node.id,
            text: node.text.clone(),
            depth,
            children: node.children.len(),
        }
    }
}

/// Runs the add-root command.
pub async fn add_root(options: &Options, text: &str) -> Result<(), Box<dyn Error>> {
    let session = Session::open(options).await?;
    let node = session.conn.add_to_root(text)?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&node)?);
    } else {
        println!("Added node {} with text \"{}\"", node.id, node.text);
    }
    session.close().await
}

/// Runs the print-nodes command.
pub async fn print_nodes(options: &Options) -> Result<(), Box<dyn Error>> {
    let session = Session::open(options).await?;
    let root = session.conn.get_or_create_root()?;
    let mut lines = vec![NodeLine::new(&root, 0)];
    for child in session.conn.children(root.id)? {
        lines.push(NodeLine::new(&child, 1));
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        for line in &lines {
            println!(
                "{}{}\t({} children)",
                "   ".repeat(line.depth),
                line.text,
                line.children
            );
        }
    }
    session.close().await
}

/// Runs the print-info command.
pub async fn print_info(options: &Options) -> Result<(), Box<dyn Error>> {
    let session = Session::open(options).await?;
    session.conn.get_or_create_root()?;
    let info = session.conn.info()?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("User id: {}", info.owner);
        if let Some(root) = info.root_id {
            println!("Root node id: {root}");
        }
        println!("Total node objects: {}", info.total_nodes);
        println!("Number of children in root: {}", info.root_children);
    }
    session.close().await
}

/// Runs the reset command.
pub async fn reset(options: &Options) -> Result<(), Box<dyn Error>> {
    let session = Session::open(options).await?;
    let deleted = session.conn.delete_all()?;
    if options.json {
        println!("{}", serde_json::json!({ "deleted": deleted }));
    } else {
        println!("Deleting {deleted} nodes");
    }
    session.close().await
}
