use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};

/// Total order used by an [`AvlTree`] to arrange its keys
pub trait Comparator<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The key type's own [`Ord`] implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F: Fn(&K, &K) -> Ordering> Comparator<K> for F {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

type Link<K, V> = Option<Box<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    value: V,
    height: u8,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K, V> Node<K, V> {
    fn leaf(key: K, value: V) -> Box<Node<K, V>> {
        Box::new(Node {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        })
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance_factor(&self) -> i16 {
        height(&self.left) as i16 - height(&self.right) as i16
    }
}

fn height<K, V>(link: &Link<K, V>) -> u8 {
    link.as_ref().map(|n| n.height).unwrap_or(0)
}

fn rotate_right<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };
    node.left = pivot.right.take();
    node.update_height();
    pivot.right = Some(node);
    pivot.update_height();
    pivot
}

fn rotate_left<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };
    node.right = pivot.left.take();
    node.update_height();
    pivot.left = Some(node);
    pivot.update_height();
    pivot
}

fn balance<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    node.update_height();
    let factor = node.balance_factor();

    if factor > 1 {
        if node.left.as_ref().map(|l| l.balance_factor() < 0).unwrap_or(false) {
            node.left = node.left.take().map(rotate_left);
        }
        return rotate_right(node);
    }
    if factor < -1 {
        if node.right.as_ref().map(|r| r.balance_factor() > 0).unwrap_or(false) {
            node.right = node.right.take().map(rotate_right);
        }
        return rotate_left(node);
    }
    node
}

fn rebalance<K, V>(link: &mut Link<K, V>) {
    if let Some(node) = link.take() {
        *link = Some(balance(node));
    }
}

/// Detaches the smallest node of a subtree, returning it and the rebalanced remainder
fn take_min<K, V>(mut node: Box<Node<K, V>>) -> (Box<Node<K, V>>, Link<K, V>) {
    match node.left.take() {
        Some(left) => {
            let (min, rest) = take_min(left);
            node.left = rest;
            (min, Some(balance(node)))
        }
        None => {
            let rest = node.right.take();
            (node, rest)
        }
    }
}

/// An ordered map stored as a height-balanced binary tree, ordered by a pluggable
///  [`Comparator`]. Keys are unique: inserting a key that is already present is rejected
///  rather than overwriting the existing entry.
pub struct AvlTree<K, V, C = NaturalOrder> {
    root: Link<K, V>,
    len: usize,
    comparator: C,
}

impl<K, V, C: Comparator<K> + Default> Default for AvlTree<K, V, C> {
    fn default() -> Self {
        AvlTree::with_comparator(C::default())
    }
}

impl<K: Ord, V> AvlTree<K, V, NaturalOrder> {
    pub fn new() -> AvlTree<K, V, NaturalOrder> {
        AvlTree::with_comparator(NaturalOrder)
    }
}

impl<K, V, C: Comparator<K>> AvlTree<K, V, C> {
    pub fn with_comparator(comparator: C) -> AvlTree<K, V, C> {
        AvlTree {
            root: None,
            len: 0,
            comparator,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the entry back if an equal key is already present
    pub fn insert(&mut self, key: K, value: V) -> Result<(), (K, V)> {
        Self::insert_into(&mut self.root, key, value, &self.comparator)?;
        self.len += 1;
        Ok(())
    }

    fn insert_into(link: &mut Link<K, V>, key: K, value: V, comparator: &C) -> Result<(), (K, V)> {
        let Some(node) = link else {
            *link = Some(Node::leaf(key, value));
            return Ok(());
        };

        match comparator.compare(&key, &node.key) {
            Ordering::Less => Self::insert_into(&mut node.left, key, value, comparator)?,
            Ordering::Greater => Self::insert_into(&mut node.right, key, value, comparator)?,
            Ordering::Equal => return Err((key, value)),
        }
        rebalance(link);
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = Self::remove_from(&mut self.root, key, &self.comparator)?;
        self.len -= 1;
        Some(value)
    }

    fn remove_from(link: &mut Link<K, V>, key: &K, comparator: &C) -> Option<V> {
        let ordering = comparator.compare(key, &link.as_ref()?.key);

        let removed = match ordering {
            Ordering::Less => Self::remove_from(&mut link.as_mut()?.left, key, comparator)?,
            Ordering::Greater => Self::remove_from(&mut link.as_mut()?.right, key, comparator)?,
            Ordering::Equal => {
                let mut node = link.take()?;
                *link = match (node.left.take(), node.right.take()) {
                    (None, None) => None,
                    (Some(child), None) | (None, Some(child)) => Some(child),
                    (Some(left), Some(right)) => {
                        let (mut successor, rest) = take_min(right);
                        successor.left = Some(left);
                        successor.right = rest;
                        Some(successor)
                    }
                };
                node.value
            }
        };
        rebalance(link);
        Some(removed)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut cur = self.root.as_ref();
        while let Some(node) = cur {
            cur = match self.comparator.compare(key, &node.key) {
                Ordering::Less => node.left.as_ref(),
                Ordering::Greater => node.right.as_ref(),
                Ordering::Equal => return Some(&node.value),
            };
        }
        None
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let mut cur = self.root.as_mut();
        while let Some(node) = cur {
            cur = match self.comparator.compare(key, &node.key) {
                Ordering::Less => node.left.as_mut(),
                Ordering::Greater => node.right.as_mut(),
                Ordering::Equal => return Some(&mut node.value),
            };
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref()?;
        while let Some(left) = node.left.as_ref() {
            node = left;
        }
        Some((&node.key, &node.value))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref()?;
        while let Some(right) = node.right.as_ref() {
            node = right;
        }
        Some((&node.key, &node.value))
    }

    /// In-order iteration, smallest key first
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left_spine(self.root.as_deref());
        iter
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }
}

impl<K: Debug, V: Debug, C: Comparator<K>> Debug for AvlTree<K, V, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left_spine(&mut self, mut node: Option<&'a Node<K, V>>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left_spine(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}

impl<'a, K, V, C: Comparator<K>> IntoIterator for &'a AvlTree<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
