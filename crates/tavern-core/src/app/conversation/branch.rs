use std::sync::Arc;
use tracing::debug;

use super::message::Message;
use super::tree::{MessageNode, MessageTree};
use crate::app::types::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

/// Result of a navigation request. Navigation never fails; requests that
/// cannot be applied leave the branch untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Moved,
    /// No sibling in the requested direction.
    OutOfRange,
    /// The node is not in the current tree or not on the current branch.
    Stale,
    /// No complete tree has been loaded yet.
    NoTree,
}

/// What happened to the navigator when it was handed a rebuilt tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeUpdate {
    /// Same messages as before; the previous tree instance was kept.
    Unchanged,
    /// First tree; the branch now follows the latest path.
    Initialized,
    /// The branch was carried over to the new tree.
    Reconciled,
}

/// 1-based position of a message among its siblings, for swipe counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingPosition {
    pub index: usize,
    pub count: usize,
}

/// Root-to-leaf path of message ids currently rendered as the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Branch {
    ids: Vec<MessageId>,
}

impl Branch {
    pub fn new(ids: Vec<MessageId>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[MessageId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|branch_id| branch_id.as_str() == id)
    }

    pub fn tail(&self) -> Option<&MessageId> {
        self.ids.last()
    }

    pub fn nodes<'a>(&'a self, tree: &'a MessageTree) -> impl Iterator<Item = &'a MessageNode> {
        self.ids.iter().filter_map(move |id| tree.node(id))
    }

    pub fn messages<'a>(&'a self, tree: &'a MessageTree) -> impl Iterator<Item = &'a Message> {
        self.nodes(tree).map(MessageNode::message)
    }

    /// Whether every id is in `tree` and each one is a child of the previous.
    pub fn is_path_in(&self, tree: &MessageTree) -> bool {
        let mut previous: Option<&MessageId> = None;
        for id in &self.ids {
            match tree.node(id) {
                Some(node) if node.parent() == previous => previous = Some(id),
                _ => return false,
            }
        }
        true
    }
}

/// Keeps the current tree snapshot and the active branch through it.
#[derive(Debug, Clone, Default)]
pub struct BranchNavigator {
    tree: Option<Arc<MessageTree>>,
    branch: Branch,
}

impl BranchNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> Option<&Arc<MessageTree>> {
        self.tree.as_ref()
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn clear(&mut self) {
        self.tree = None;
        self.branch = Branch::default();
    }

    /// Installs a rebuilt tree. An unchanged tree keeps the previous instance
    /// and branch. Otherwise the surviving prefix of the branch is kept,
    /// switched to a newly arrived newer sibling where one appeared, and
    /// completed down to a leaf.
    pub fn set_tree(&mut self, tree: MessageTree) -> TreeUpdate {
        let Some(previous) = self.tree.take() else {
            self.branch = Branch::new(tree.latest_path());
            debug!(
                target: "branch_navigator::set_tree",
                branch = ?self.branch.ids(),
                "Initialized branch from latest path"
            );
            self.tree = Some(Arc::new(tree));
            return TreeUpdate::Initialized;
        };

        if !previous.is_changed(tree.messages()) {
            self.tree = Some(previous);
            return TreeUpdate::Unchanged;
        }

        self.branch = reconcile_branch(&previous, &self.branch, &tree);
        debug!(
            target: "branch_navigator::set_tree",
            branch = ?self.branch.ids(),
            "Reconciled branch with rebuilt tree"
        );
        self.tree = Some(Arc::new(tree));
        TreeUpdate::Reconciled
    }

    /// Moves `current` to its previous or next sibling, keeping the branch
    /// above it and descending through the newest children below it.
    pub fn navigate(&mut self, current: &str, direction: Direction) -> NavigationOutcome {
        let Some(tree) = self.tree.as_ref() else {
            return NavigationOutcome::NoTree;
        };

        let Some(siblings) = tree.siblings(current) else {
            debug!(target: "branch_navigator::navigate", current, "Unknown message, ignoring");
            return NavigationOutcome::Stale;
        };
        let Some(position) = self.branch.position(current) else {
            debug!(target: "branch_navigator::navigate", current, "Message not on branch, ignoring");
            return NavigationOutcome::Stale;
        };
        let Some(index) = siblings.iter().position(|id| id.as_str() == current) else {
            return NavigationOutcome::Stale;
        };

        let target = match direction {
            Direction::Previous => index.checked_sub(1),
            Direction::Next => Some(index + 1),
        };
        let Some(target) = target.and_then(|target| siblings.get(target)) else {
            return NavigationOutcome::OutOfRange;
        };

        let mut ids: Vec<MessageId> = self.branch.ids().iter().take(position).cloned().collect();
        ids.extend(tree.latest_descent(target));

        debug!(
            target: "branch_navigator::navigate",
            from = current,
            to = %target,
            ?direction,
            "Navigated to sibling"
        );
        self.branch = Branch::new(ids);
        NavigationOutcome::Moved
    }

    /// Switches to the branch running through `id`, extended by the newest
    /// children below it. Returns false if `id` is unknown.
    pub fn checkout(&mut self, id: &str) -> bool {
        let Some(tree) = self.tree.as_ref() else {
            return false;
        };
        let mut ids = tree.path_to_root(id);
        if ids.is_empty() {
            return false;
        }
        ids.pop();
        ids.extend(tree.latest_descent(id));
        self.branch = Branch::new(ids);
        true
    }

    pub fn sibling_position(&self, id: &str) -> Option<SiblingPosition> {
        let siblings = self.tree.as_ref()?.siblings(id)?;
        let index = siblings.iter().position(|sibling| sibling.as_str() == id)?;
        Some(SiblingPosition {
            index: index + 1,
            count: siblings.len(),
        })
    }

    pub fn branch_messages(&self) -> Vec<&Message> {
        match self.tree.as_ref() {
            Some(tree) => self.branch.messages(tree).collect(),
            None => Vec::new(),
        }
    }
}

fn reconcile_branch(previous: &MessageTree, branch: &Branch, tree: &MessageTree) -> Branch {
    let mut path: Vec<MessageId> = Vec::with_capacity(branch.len());

    for id in branch.ids() {
        let Some(node) = tree.node(id) else {
            break;
        };
        if node.parent() != path.last() {
            break;
        }

        let fresh_sibling = tree.siblings(id).and_then(|siblings| {
            siblings
                .iter()
                .filter(|sibling| *sibling > id && !previous.contains(sibling))
                .max()
        });

        if let Some(sibling) = fresh_sibling {
            debug!(
                target: "branch_navigator::reconcile",
                superseded = %id,
                by = %sibling,
                "Newer sibling arrived, switching branch"
            );
            path.push(sibling.clone());
            break;
        }
        path.push(id.clone());
    }

    let Some(tail) = path.pop() else {
        return Branch::new(tree.latest_path());
    };
    path.extend(tree.latest_descent(&tail));
    Branch::new(path)
}
