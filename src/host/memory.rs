//! In-process document model implementing the host traits.
//!
//! `MemoryDocument` keeps a small element tree, delivers mutation records to
//! subscribers synchronously, broadcasts named events, and instruments
//! `yield_to_host` so callers can assert on batching behaviour.

use super::document::{HostDocument, HostFuture};
use super::element::{ElementId, ElementRef, HostElement, HostError};
use super::mutation::{
    MutationBatch, MutationKind, MutationRecord, MutationSubscription, ObserveOptions,
    SubscriptionHandle,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Node {
    tag: String,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    attributes: BTreeMap<String, String>,
    retained: Option<ElementRef>,
}

struct ObserverEntry {
    id: u64,
    target: ElementId,
    options: ObserveOptions,
    sender: mpsc::UnboundedSender<MutationBatch>,
    active: Arc<AtomicBool>,
}

struct Tree {
    next_element: u64,
    next_observer: u64,
    body: ElementId,
    nodes: HashMap<ElementId, Node>,
    observers: Vec<ObserverEntry>,
    failing_removals: HashSet<ElementId>,
}

#[derive(Default)]
struct YieldStats {
    yields: AtomicUsize,
    removals_since_yield: AtomicUsize,
    max_removals_between_yields: AtomicUsize,
}

struct DocumentInner {
    tree: Mutex<Tree>,
    location: Mutex<String>,
    events: broadcast::Sender<String>,
    stats: YieldStats,
}

impl DocumentInner {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_removal(&self) {
        let pending = self
            .stats
            .removals_since_yield
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        self.stats
            .max_removals_between_yields
            .fetch_max(pending, Ordering::SeqCst);
    }
}

/// In-memory implementation of [`HostDocument`].
#[derive(Clone)]
pub struct MemoryDocument {
    inner: Arc<DocumentInner>,
}

impl MemoryDocument {
    pub fn new(location: impl Into<String>) -> Self {
        let body = ElementId::new(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            body,
            Node {
                tag: "body".to_owned(),
                parent: None,
                children: Vec::new(),
                attributes: BTreeMap::new(),
                retained: None,
            },
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(DocumentInner {
            tree: Mutex::new(Tree {
                next_element: 1,
                next_observer: 0,
                body,
                nodes,
                observers: Vec::new(),
                failing_removals: HashSet::new(),
            }),
            location: Mutex::new(location.into()),
            events,
            stats: YieldStats::default(),
        });
        {
            let mut tree = inner.tree();
            let handle: ElementRef = Arc::new(MemoryElement {
                id: body,
                document: Arc::downgrade(&inner),
            });
            if let Some(node) = tree.nodes.get_mut(&body) {
                node.retained = Some(handle);
            }
        }
        Self { inner }
    }

    /// Returns the document as a shared trait object.
    pub fn shared(&self) -> Arc<dyn HostDocument> {
        Arc::new(self.clone())
    }

    /// Creates a detached element.
    pub fn create_element(&self, tag: &str) -> ElementRef {
        let mut tree = self.inner.tree();
        let id = ElementId::new(tree.next_element);
        tree.next_element += 1;
        tree.nodes.insert(
            id,
            Node {
                tag: tag.to_owned(),
                parent: None,
                children: Vec::new(),
                attributes: BTreeMap::new(),
                retained: None,
            },
        );
        Arc::new(MemoryElement {
            id,
            document: Arc::downgrade(&self.inner),
        })
    }

    /// Creates an element with the given classes and appends it to `parent`.
    pub fn create_child(
        &self,
        parent: &ElementRef,
        tag: &str,
        classes: &[&str],
    ) -> Result<ElementRef, HostError> {
        let child = self.create_element(tag);
        if !classes.is_empty() {
            child.set_attribute("class", &classes.join(" "))?;
        }
        self.append_child(parent, &child)?;
        Ok(child)
    }

    pub fn append_child(&self, parent: &ElementRef, child: &ElementRef) -> Result<(), HostError> {
        self.append_children(parent, std::slice::from_ref(child))
    }

    /// Appends every child under `parent`, delivering a single mutation batch.
    pub fn append_children(
        &self,
        parent: &ElementRef,
        children: &[ElementRef],
    ) -> Result<(), HostError> {
        let mut tree = self.inner.tree();
        let parent_id = parent.id();
        if !tree.nodes.contains_key(&parent_id) {
            return Err(HostError::Detached { element: parent_id });
        }

        for child in children {
            let child_id = child.id();
            if child_id == parent_id || tree.is_ancestor(child_id, parent_id) {
                return Err(HostError::Rejected {
                    operation: "append_child",
                    reason: format!("{child_id} cannot become a descendant of itself"),
                });
            }
            tree.detach(child_id);
            if let Some(node) = tree.nodes.get_mut(&child_id) {
                node.parent = Some(parent_id);
            } else {
                return Err(HostError::Detached { element: child_id });
            }
            if let Some(node) = tree.nodes.get_mut(&parent_id) {
                node.children.push(child_id);
            }
            if tree.is_connected(parent_id) {
                tree.retain_subtree(child, &self.inner);
            }
        }

        let added = children
            .iter()
            .map(|child| tree.handle(child.id(), &self.inner))
            .collect();
        tree.deliver(MutationRecord {
            target: parent_id,
            kind: MutationKind::ChildList,
            added,
            removed: Vec::new(),
        });
        Ok(())
    }

    pub fn location_string(&self) -> String {
        self.inner
            .location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Updates the location without emitting any event, as a silent
    /// `history.replaceState` would.
    pub fn set_location(&self, location: impl Into<String>) {
        *self
            .inner
            .location
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = location.into();
    }

    /// Updates the location and dispatches the named navigation event.
    pub fn push_state(&self, location: impl Into<String>, event: &str) {
        self.set_location(location);
        self.dispatch_event(event);
    }

    /// Dispatches a named event; returns how many listeners received it.
    pub fn dispatch_event(&self, name: &str) -> usize {
        self.inner.events.send(name.to_owned()).unwrap_or(0)
    }

    /// Makes every future `remove()` of `element` fail.
    pub fn fail_removal(&self, element: &ElementRef) {
        self.inner.tree().failing_removals.insert(element.id());
    }

    pub fn yield_count(&self) -> usize {
        self.inner.stats.yields.load(Ordering::SeqCst)
    }

    pub fn max_removals_between_yields(&self) -> usize {
        self.inner
            .stats
            .max_removals_between_yields
            .load(Ordering::SeqCst)
    }

    pub fn reset_yield_stats(&self) {
        self.inner.stats.yields.store(0, Ordering::SeqCst);
        self.inner
            .stats
            .removals_since_yield
            .store(0, Ordering::SeqCst);
        self.inner
            .stats
            .max_removals_between_yields
            .store(0, Ordering::SeqCst);
    }

    /// Number of mutation subscriptions still connected.
    pub fn active_observer_count(&self) -> usize {
        self.inner
            .tree()
            .observers
            .iter()
            .filter(|entry| entry.active.load(Ordering::SeqCst))
            .count()
    }

    /// Number of connected elements carrying the attribute `name`.
    pub fn count_with_attribute(&self, name: &str) -> usize {
        self.query_attribute(name).len()
    }

    pub fn tag_of(&self, element: &ElementRef) -> Option<String> {
        self.inner
            .tree()
            .nodes
            .get(&element.id())
            .map(|node| node.tag.clone())
    }
}

impl fmt::Debug for MemoryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = self.inner.tree();
        f.debug_struct("MemoryDocument")
            .field("location", &self.location_string())
            .field("elements", &tree.nodes.len())
            .field("observers", &tree.observers.len())
            .finish()
    }
}

impl HostDocument for MemoryDocument {
    fn location(&self) -> String {
        self.location_string()
    }

    fn body(&self) -> ElementRef {
        let mut tree = self.inner.tree();
        let body = tree.body;
        tree.handle(body, &self.inner)
    }

    fn query_attribute(&self, name: &str) -> Vec<ElementRef> {
        let mut tree = self.inner.tree();
        let mut ids: Vec<ElementId> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.attributes.contains_key(name))
            .map(|(id, _)| *id)
            .collect();
        ids.retain(|id| tree.is_connected(*id));
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| tree.handle(id, &self.inner))
            .collect()
    }

    fn observe(
        &self,
        target: &ElementRef,
        options: ObserveOptions,
    ) -> Result<MutationSubscription, HostError> {
        let mut tree = self.inner.tree();
        let target_id = target.id();
        if !tree.is_connected(target_id) {
            return Err(HostError::Detached { element: target_id });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let id = tree.next_observer;
        tree.next_observer += 1;
        tree.observers.push(ObserverEntry {
            id,
            target: target_id,
            options,
            sender,
            active: active.clone(),
        });

        let handle = MemorySubscription {
            id,
            active,
            document: Arc::downgrade(&self.inner),
        };
        Ok(MutationSubscription::new(receiver, Arc::new(handle)))
    }

    fn events(&self) -> broadcast::Receiver<String> {
        self.inner.events.subscribe()
    }

    fn yield_to_host(&self) -> HostFuture<'_, ()> {
        self.inner.stats.yields.fetch_add(1, Ordering::SeqCst);
        self.inner
            .stats
            .removals_since_yield
            .store(0, Ordering::SeqCst);
        Box::pin(tokio::task::yield_now())
    }
}

impl Tree {
    fn handle(&mut self, id: ElementId, inner: &Arc<DocumentInner>) -> ElementRef {
        if let Some(retained) = self.nodes.get(&id).and_then(|node| node.retained.clone()) {
            return retained;
        }
        Arc::new(MemoryElement {
            id,
            document: Arc::downgrade(inner),
        })
    }

    fn is_connected(&self, id: ElementId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == self.body {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|node| node.parent);
        }
        false
    }

    fn is_ancestor(&self, ancestor: ElementId, id: ElementId) -> bool {
        let mut current = self.nodes.get(&id).and_then(|node| node.parent);
        while let Some(node_id) = current {
            if node_id == ancestor {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|node| node.parent);
        }
        false
    }

    fn subtree(&self, root: ElementId) -> Vec<ElementId> {
        let mut pending = vec![root];
        let mut collected = Vec::new();
        while let Some(id) = pending.pop() {
            collected.push(id);
            if let Some(node) = self.nodes.get(&id) {
                pending.extend(node.children.iter().copied());
            }
        }
        collected
    }

    /// Keeps connected nodes alive; the root keeps the caller's handle so that
    /// weak references taken from it stay meaningful.
    fn retain_subtree(&mut self, root: &ElementRef, inner: &Arc<DocumentInner>) {
        let root_id = root.id();
        for id in self.subtree(root_id) {
            if let Some(node) = self.nodes.get_mut(&id) {
                if node.retained.is_none() {
                    let handle: ElementRef = if id == root_id {
                        Arc::clone(root)
                    } else {
                        Arc::new(MemoryElement {
                            id,
                            document: Arc::downgrade(inner),
                        })
                    };
                    node.retained = Some(handle);
                }
            }
        }
    }

    fn release_subtree(&mut self, root: ElementId) {
        for id in self.subtree(root) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.retained = None;
            }
        }
    }

    /// Unlinks `id` from its parent; returns the former parent.
    fn detach(&mut self, id: ElementId) -> Option<ElementId> {
        let parent = self.nodes.get_mut(&id)?.parent.take()?;
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|child| *child != id);
        }
        Some(parent)
    }

    fn deliver(&mut self, record: MutationRecord) {
        let targets: Vec<usize> = self
            .observers
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.active.load(Ordering::SeqCst))
            .filter(|(_, entry)| match record.kind {
                MutationKind::ChildList => entry.options.child_list,
                MutationKind::Attributes { .. } => entry.options.attributes,
            })
            .filter(|(_, entry)| {
                entry.target == record.target
                    || (entry.options.subtree && self.is_ancestor(entry.target, record.target))
            })
            .map(|(index, _)| index)
            .collect();

        for index in targets {
            let entry = &self.observers[index];
            if entry.sender.send(vec![record.clone()]).is_err() {
                entry.active.store(false, Ordering::SeqCst);
            }
        }
        self.observers
            .retain(|entry| entry.active.load(Ordering::SeqCst));
    }
}

struct MemorySubscription {
    id: u64,
    active: Arc<AtomicBool>,
    document: Weak<DocumentInner>,
}

impl SubscriptionHandle for MemorySubscription {
    fn disconnect(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(document) = self.document.upgrade() {
            document.tree().observers.retain(|entry| entry.id != self.id);
        }
    }

    fn is_connected(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Handle to an element of a [`MemoryDocument`].
pub struct MemoryElement {
    id: ElementId,
    document: Weak<DocumentInner>,
}

impl MemoryElement {
    fn with_tree<T>(&self, default: T, f: impl FnOnce(&mut Tree) -> T) -> T {
        let Some(document) = self.document.upgrade() else {
            return default;
        };
        let mut tree = document.tree();
        f(&mut tree)
    }
}

impl fmt::Debug for MemoryElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryElement").field("id", &self.id).finish()
    }
}

impl HostElement for MemoryElement {
    fn id(&self) -> ElementId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.with_tree(false, |tree| tree.is_connected(self.id))
    }

    fn remove(&self) -> Result<(), HostError> {
        let Some(document) = self.document.upgrade() else {
            return Err(HostError::Detached { element: self.id });
        };
        let mut tree = document.tree();
        if tree.failing_removals.contains(&self.id) {
            return Err(HostError::Rejected {
                operation: "remove",
                reason: format!("removal of {} refused by host", self.id),
            });
        }
        if self.id == tree.body {
            return Err(HostError::Rejected {
                operation: "remove",
                reason: "the document body cannot be removed".to_owned(),
            });
        }
        let was_connected = tree.is_connected(self.id);
        let Some(parent) = tree.detach(self.id) else {
            return Ok(());
        };
        if was_connected {
            tree.release_subtree(self.id);
            document.note_removal();
        }
        tree.deliver(MutationRecord {
            target: parent,
            kind: MutationKind::ChildList,
            added: Vec::new(),
            removed: vec![self.id],
        });
        Ok(())
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.with_tree(None, |tree| {
            tree.nodes
                .get(&self.id)
                .and_then(|node| node.attributes.get(name).cloned())
        })
    }

    fn set_attribute(&self, name: &str, value: &str) -> Result<(), HostError> {
        self.with_tree(Err(HostError::Detached { element: self.id }), |tree| {
            let Some(node) = tree.nodes.get_mut(&self.id) else {
                return Err(HostError::Detached { element: self.id });
            };
            node.attributes.insert(name.to_owned(), value.to_owned());
            tree.deliver(MutationRecord {
                target: self.id,
                kind: MutationKind::Attributes {
                    name: name.to_owned(),
                },
                added: Vec::new(),
                removed: Vec::new(),
            });
            Ok(())
        })
    }

    fn remove_attribute(&self, name: &str) -> Result<(), HostError> {
        self.with_tree(Err(HostError::Detached { element: self.id }), |tree| {
            let Some(node) = tree.nodes.get_mut(&self.id) else {
                return Err(HostError::Detached { element: self.id });
            };
            if node.attributes.remove(name).is_some() {
                tree.deliver(MutationRecord {
                    target: self.id,
                    kind: MutationKind::Attributes {
                        name: name.to_owned(),
                    },
                    added: Vec::new(),
                    removed: Vec::new(),
                });
            }
            Ok(())
        })
    }

    fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .map(|classes| classes.split_whitespace().any(|value| value == class))
            .unwrap_or(false)
    }

    fn contains_class(&self, class: &str) -> bool {
        self.with_tree(false, |tree| {
            tree.subtree(self.id).into_iter().any(|id| {
                tree.nodes
                    .get(&id)
                    .and_then(|node| node.attributes.get("class"))
                    .map(|classes| classes.split_whitespace().any(|value| value == class))
                    .unwrap_or(false)
            })
        })
    }
}
