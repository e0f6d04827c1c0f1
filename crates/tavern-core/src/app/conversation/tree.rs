use std::collections::HashMap;
use tracing::{debug, trace};

use super::message::Message;
use crate::app::types::MessageId;

/// A message placed in a [`MessageTree`].
///
/// Nodes reference each other by id only; the tree owns every node.
#[derive(Debug, Clone)]
pub struct MessageNode {
    message: Message,
    parent: Option<MessageId>,
    descendants: Vec<MessageId>,
}

impl MessageNode {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Id of the parent node, if the parent is present in the tree.
    pub fn parent(&self) -> Option<&MessageId> {
        self.parent.as_ref()
    }

    /// Direct children, in the order they were discovered.
    pub fn descendants(&self) -> &[MessageId] {
        &self.descendants
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.descendants.is_empty()
    }
}

/// Shape problems found while building a tree. None of them stop the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeIssue {
    /// The parent is not part of the input; the message became a root.
    MissingParent {
        id: MessageId,
        parent_id: MessageId,
    },
    /// The parent id does not sort before the message id; the message became
    /// a root so that the tree stays acyclic.
    ParentNotOlder {
        id: MessageId,
        parent_id: MessageId,
    },
}

impl TreeIssue {
    pub fn message_id(&self) -> &MessageId {
        match self {
            TreeIssue::MissingParent { id, .. } | TreeIssue::ParentNotOlder { id, .. } => id,
        }
    }
}

/// Immutable snapshot of one chat's messages arranged as a tree.
#[derive(Debug, Clone, Default)]
pub struct MessageTree {
    nodes: HashMap<MessageId, MessageNode>,
    roots: Vec<MessageId>,
    latest: Option<MessageId>,
    messages: Vec<Message>,
    issues: Vec<TreeIssue>,
}

impl MessageTree {
    pub fn build(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut ordered: Vec<Message> = Vec::new();
        let mut positions: HashMap<MessageId, usize> = HashMap::new();
        for message in messages {
            if let Some(&position) = positions.get(&message.id) {
                // Later copies win, the first position is kept
                if let Some(slot) = ordered.get_mut(position) {
                    *slot = message;
                }
            } else {
                positions.insert(message.id.clone(), ordered.len());
                ordered.push(message);
            }
        }

        let mut nodes: HashMap<MessageId, MessageNode> = ordered
            .iter()
            .map(|message| {
                (
                    message.id.clone(),
                    MessageNode {
                        message: message.clone(),
                        parent: None,
                        descendants: Vec::new(),
                    },
                )
            })
            .collect();

        let mut roots = Vec::new();
        let mut issues = Vec::new();

        for message in &ordered {
            let Some(parent_id) = message.parent_id.as_ref() else {
                roots.push(message.id.clone());
                continue;
            };

            if parent_id >= &message.id && nodes.contains_key(parent_id) {
                issues.push(TreeIssue::ParentNotOlder {
                    id: message.id.clone(),
                    parent_id: parent_id.clone(),
                });
                roots.push(message.id.clone());
                continue;
            }

            match nodes.get_mut(parent_id) {
                Some(parent) => {
                    parent.descendants.push(message.id.clone());
                    if let Some(node) = nodes.get_mut(&message.id) {
                        node.parent = Some(parent_id.clone());
                    }
                }
                None => {
                    issues.push(TreeIssue::MissingParent {
                        id: message.id.clone(),
                        parent_id: parent_id.clone(),
                    });
                    roots.push(message.id.clone());
                }
            }
        }

        let mut tree = Self {
            nodes,
            roots,
            latest: None,
            messages: ordered,
            issues,
        };
        tree.latest = tree.find_latest();

        debug!(
            target: "message_tree::build",
            nodes = tree.nodes.len(),
            roots = tree.roots.len(),
            latest = ?tree.latest,
            issues = tree.issues.len(),
            "Built message tree"
        );
        tree
    }

    pub fn node(&self, id: &str) -> Option<&MessageNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn roots(&self) -> &[MessageId] {
        &self.roots
    }

    /// The leaf reached from the roots by always following the child with the
    /// greatest id.
    pub fn latest(&self) -> Option<&MessageNode> {
        self.latest.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The messages this tree was built from, deduplicated by id.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn issues(&self) -> &[TreeIssue] {
        &self.issues
    }

    /// Messages whose parent is absent from the tree.
    pub fn dangling_parents(&self) -> Vec<&TreeIssue> {
        self.issues
            .iter()
            .filter(|issue| matches!(issue, TreeIssue::MissingParent { .. }))
            .collect()
    }

    /// The node and its siblings: the roots for a root node, otherwise the
    /// parent's descendants.
    pub fn siblings(&self, id: &str) -> Option<&[MessageId]> {
        let node = self.nodes.get(id)?;
        match node.parent.as_ref() {
            Some(parent_id) => self
                .nodes
                .get(parent_id)
                .map(|parent| parent.descendants.as_slice()),
            None => Some(self.roots.as_slice()),
        }
    }

    /// Greatest child id of `parent`, or the greatest root id when `parent`
    /// is `None`. `None` if there is no such child or `parent` is unknown.
    pub fn greatest_child(&self, parent: Option<&str>) -> Option<&MessageId> {
        match parent {
            Some(parent) => self.nodes.get(parent).and_then(Self::max_child),
            None => self.roots.iter().max(),
        }
    }

    /// Ids from the root down to `id`, inclusive. Empty if `id` is unknown.
    pub fn path_to_root(&self, id: &str) -> Vec<MessageId> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(id);
        while let Some(node) = current {
            path.push(node.id().clone());
            current = node.parent.as_ref().and_then(|parent| self.nodes.get(parent));
        }
        path.reverse();
        path
    }

    /// `id` followed by repeatedly descending to the child with the greatest
    /// id, down to a leaf. Empty if `id` is unknown.
    pub fn latest_descent(&self, id: &str) -> Vec<MessageId> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(id);
        while let Some(node) = current {
            path.push(node.id().clone());
            current = Self::max_child(node).and_then(|child| self.nodes.get(child));
        }
        path
    }

    /// Root-to-leaf path ending at [`MessageTree::latest`].
    pub fn latest_path(&self) -> Vec<MessageId> {
        self.latest
            .as_ref()
            .map(|id| self.path_to_root(id))
            .unwrap_or_default()
    }

    /// Whether `messages` differs from the set this tree was built from in
    /// membership, parent links, roles or content.
    pub fn is_changed(&self, messages: &[Message]) -> bool {
        let mut incoming: HashMap<&MessageId, &Message> = HashMap::with_capacity(messages.len());
        for message in messages {
            incoming.insert(&message.id, message);
        }

        if incoming.len() != self.nodes.len() {
            return true;
        }

        let changed = incoming.iter().any(|(id, message)| {
            self.nodes
                .get(*id)
                .is_none_or(|node| !node.message.same_shape(message))
        });
        trace!(target: "message_tree::is_changed", changed, "Compared message sets");
        changed
    }

    fn max_child(node: &MessageNode) -> Option<&MessageId> {
        node.descendants.iter().fold(None, |best, child| match best {
            Some(best) if best >= child => Some(best),
            _ => Some(child),
        })
    }

    fn find_latest(&self) -> Option<MessageId> {
        self.roots
            .iter()
            .filter_map(|root| self.latest_descent(root).pop())
            .fold(None, |best, leaf| match best {
                Some(best) if best >= leaf => Some(best),
                _ => Some(leaf),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ids, message};

    #[test]
    fn test_empty_input() {
        let tree = MessageTree::build(Vec::new());
        assert!(tree.is_empty());
        assert!(tree.roots().is_empty());
        assert!(tree.latest().is_none());
        assert!(tree.latest_path().is_empty());
    }

    #[test]
    fn test_greater_sibling_wins() {
        let tree = MessageTree::build(vec![
            message("1", None),
            message("2", Some("1")),
            message("3", Some("1")),
        ]);

        assert_eq!(tree.roots(), ids(&["1"]).as_slice());
        assert_eq!(
            tree.node("1").unwrap().descendants(),
            ids(&["2", "3"]).as_slice()
        );
        assert_eq!(tree.latest_path(), ids(&["1", "3"]));
    }

    #[test]
    fn test_per_level_max_beats_deeper_subtree() {
        let tree = MessageTree::build(vec![
            message("1", None),
            message("2", Some("1")),
            message("3", Some("1")),
            message("4", Some("2")),
        ]);

        assert_eq!(tree.latest_path(), ids(&["1", "3"]));
        assert_eq!(tree.latest_descent("2"), ids(&["2", "4"]));
    }

    #[test]
    fn test_missing_parent_promoted_to_root() {
        let tree = MessageTree::build(vec![
            message("2", Some("1")),
            message("3", Some("2")),
        ]);

        assert_eq!(tree.roots(), ids(&["2"]).as_slice());
        assert_eq!(tree.latest_path(), ids(&["2", "3"]));
        assert_eq!(
            tree.dangling_parents(),
            vec![&TreeIssue::MissingParent {
                id: "2".into(),
                parent_id: "1".into(),
            }]
        );
    }

    #[test]
    fn test_parent_not_older_is_not_attached() {
        let tree = MessageTree::build(vec![message("5", None), message("3", Some("5"))]);

        assert_eq!(tree.roots(), ids(&["5", "3"]).as_slice());
        assert_eq!(tree.issues().len(), 1);
        assert!(tree.node("5").unwrap().is_leaf());
    }

    #[test]
    fn test_multiple_roots_pick_greatest_leaf() {
        let tree = MessageTree::build(vec![
            message("1", None),
            message("2", None),
            message("3", Some("1")),
            message("4", Some("3")),
            message("5", Some("2")),
        ]);

        assert_eq!(tree.roots(), ids(&["1", "2"]).as_slice());
        assert_eq!(tree.latest_path(), ids(&["2", "5"]));
        assert_eq!(tree.siblings("1").unwrap(), ids(&["1", "2"]).as_slice());
    }

    #[test]
    fn test_duplicate_ids_keep_last_copy() {
        let mut edited = message("2", Some("1"));
        edited.content = crate::app::conversation::MessageContent::text("edited");

        let tree = MessageTree::build(vec![message("1", None), message("2", Some("1")), edited]);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.node("2").unwrap().message().extract_text(), "edited");
        assert_eq!(tree.node("1").unwrap().descendants().len(), 1);
    }

    #[test]
    fn test_is_changed_detects_content_and_membership() {
        let messages = vec![message("1", None), message("2", Some("1"))];
        let tree = MessageTree::build(messages.clone());

        assert!(!tree.is_changed(&messages));

        let mut reordered = messages.clone();
        reordered.reverse();
        assert!(!tree.is_changed(&reordered));

        let mut edited = messages.clone();
        edited[1].content = crate::app::conversation::MessageContent::text("other");
        assert!(tree.is_changed(&edited));

        let mut reparented = messages.clone();
        reparented[1].parent_id = None;
        assert!(tree.is_changed(&reparented));

        let mut grown = messages.clone();
        grown.push(message("3", Some("2")));
        assert!(tree.is_changed(&grown));

        assert!(tree.is_changed(&messages[..1]));
    }

    #[test]
    fn test_greatest_child() {
        let tree = MessageTree::build(vec![
            message("1", None),
            message("2", Some("1")),
            message("4", Some("1")),
            message("3", Some("2")),
            message("5", None),
        ]);

        assert_eq!(tree.greatest_child(Some("1")).map(MessageId::as_str), Some("4"));
        assert_eq!(tree.greatest_child(None).map(MessageId::as_str), Some("5"));
        assert_eq!(tree.greatest_child(Some("4")), None);
        assert_eq!(tree.greatest_child(Some("9")), None);
    }

    #[test]
    fn test_path_to_root_and_unknown_ids() {
        let tree = MessageTree::build(vec![
            message("1", None),
            message("2", Some("1")),
            message("3", Some("2")),
        ]);

        assert_eq!(tree.path_to_root("3"), ids(&["1", "2", "3"]));
        assert!(tree.path_to_root("9").is_empty());
        assert!(tree.latest_descent("9").is_empty());
        assert!(tree.siblings("9").is_none());
    }
}
